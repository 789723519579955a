use chrono::NaiveDate;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;
use utoipa::ToSchema;

use crate::errors::PortfolioError;

/// One period of historical returns.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct ReturnRow {
    pub date: NaiveDate,
    /// One entry per column of the owning matrix, `None` marks a missing observation.
    pub values: Vec<Option<f64>>,
}

/// Half-open date range `[start, end)`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, ToSchema)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        DateWindow { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date < self.end
    }
}

/// Historical periodic returns indexed by date, with named columns.
///
/// Rows are kept sorted by date (ascending) regardless of the order they were supplied in.
#[derive(Serialize, Debug, Clone, ToSchema)]
pub struct ReturnMatrix {
    assets: Vec<String>,
    rows: Vec<ReturnRow>,
}

impl ReturnMatrix {
    pub fn new(assets: Vec<String>, mut rows: Vec<ReturnRow>) -> Result<Self, PortfolioError> {
        if let Some(bad_row) = rows.iter().find(|row| row.values.len() != assets.len()) {
            return Err(PortfolioError::DimensionMismatch {
                what: "return row width",
                expected: assets.len(),
                actual: bad_row.values.len(),
            });
        }
        rows.sort_by_key(|row| row.date);
        Ok(ReturnMatrix { assets, rows })
    }

    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    pub fn rows(&self) -> &[ReturnRow] {
        &self.rows
    }

    /// Extracts the rows inside `window` as a dense (periods x universe) matrix whose
    /// columns follow `universe` order. Missing or NaN observations become 0.
    pub fn windowed(
        &self,
        universe: &[String],
        window: &DateWindow,
    ) -> Result<DMatrix<f64>, PortfolioError> {
        let column_of: HashMap<&str, usize> = self
            .assets
            .iter()
            .enumerate()
            .map(|(idx, asset)| (asset.as_str(), idx))
            .collect();

        let columns = universe
            .iter()
            .map(|asset| {
                column_of
                    .get(asset.as_str())
                    .copied()
                    .ok_or_else(|| PortfolioError::UnknownAsset(asset.clone()))
            })
            .collect::<Result<Vec<usize>, _>>()?;

        let in_window: Vec<&ReturnRow> = self
            .rows
            .iter()
            .filter(|row| window.contains(row.date))
            .collect();

        debug!(
            "{} of {} return rows fall in [{}, {})",
            in_window.len(),
            self.rows.len(),
            window.start,
            window.end
        );

        Ok(DMatrix::from_fn(
            in_window.len(),
            columns.len(),
            |period, asset| match in_window[period].values[columns[asset]] {
                Some(value) if value.is_finite() => value,
                _ => 0.,
            },
        ))
    }
}

/// Sample covariance (n - 1 denominator) of the columns of `returns`, scaled by
/// `annualization_factor`. The result is exactly symmetric.
pub fn estimate_covariance(
    returns: &DMatrix<f64>,
    annualization_factor: usize,
) -> Result<DMatrix<f64>, PortfolioError> {
    let periods = returns.nrows();
    if periods < 2 {
        return Err(PortfolioError::InsufficientData { rows: periods });
    }

    let means = returns.row_mean();
    let centered = DMatrix::from_fn(periods, returns.ncols(), |period, asset| {
        returns[(period, asset)] - means[asset]
    });

    let scale = annualization_factor as f64 / (periods as f64 - 1.);
    let covariance = centered.transpose() * &centered * scale;

    // floating point products can differ in the last bits between (i, j) and (j, i)
    Ok((&covariance + covariance.transpose()) * 0.5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::FLOAT_COMPARISON_EPSILON;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 1, day).unwrap()
    }

    fn row(day: u32, values: &[Option<f64>]) -> ReturnRow {
        ReturnRow {
            date: date(day),
            values: values.to_vec(),
        }
    }

    fn names(assets: &[&str]) -> Vec<String> {
        assets.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn test_covariance_of_known_series() {
        let returns = DMatrix::from_row_slice(3, 2, &[1., 2., 2., 4., 3., 6.]);
        let covariance = estimate_covariance(&returns, 1).unwrap();
        assert!((covariance[(0, 0)] - 1.).abs() < FLOAT_COMPARISON_EPSILON);
        assert!((covariance[(1, 1)] - 4.).abs() < FLOAT_COMPARISON_EPSILON);
        assert!((covariance[(0, 1)] - 2.).abs() < FLOAT_COMPARISON_EPSILON);
        assert_eq!(covariance[(0, 1)], covariance[(1, 0)]);

        let annualized = estimate_covariance(&returns, 60).unwrap();
        assert!((annualized[(1, 1)] - 240.).abs() < FLOAT_COMPARISON_EPSILON);
    }

    #[test]
    fn test_covariance_needs_two_rows() {
        let one_row = DMatrix::from_row_slice(1, 2, &[0.1, 0.2]);
        assert_eq!(
            estimate_covariance(&one_row, 60),
            Err(PortfolioError::InsufficientData { rows: 1 })
        );
        let empty = DMatrix::<f64>::zeros(0, 3);
        assert_eq!(
            estimate_covariance(&empty, 60),
            Err(PortfolioError::InsufficientData { rows: 0 })
        );
    }

    #[test]
    fn test_window_is_half_open_and_fills_missing() {
        let matrix = ReturnMatrix::new(
            names(&["A", "B"]),
            vec![
                row(3, &[Some(0.3), None]),
                row(1, &[Some(0.1), Some(0.5)]),
                row(2, &[Some(f64::NAN), Some(0.2)]),
                row(4, &[Some(0.4), Some(0.4)]),
            ],
        )
        .unwrap();

        assert_eq!(matrix.rows()[0].date, date(1), "rows should be sorted by date");

        let window = DateWindow::new(date(1), date(4));
        let dense = matrix.windowed(&names(&["A", "B"]), &window).unwrap();
        assert_eq!(dense.shape(), (3, 2), "end date is exclusive");
        assert_eq!(dense[(0, 0)], 0.1);
        assert_eq!(dense[(1, 0)], 0.0, "NaN is treated as missing");
        assert_eq!(dense[(2, 1)], 0.0, "None is treated as zero");
    }

    #[test]
    fn test_window_follows_universe_order() {
        let matrix = ReturnMatrix::new(
            names(&["A", "B", "C"]),
            vec![row(1, &[Some(1.), Some(2.), Some(3.)])],
        )
        .unwrap();
        let window = DateWindow::new(date(1), date(2));

        let dense = matrix.windowed(&names(&["C", "A"]), &window).unwrap();
        assert_eq!(dense[(0, 0)], 3.);
        assert_eq!(dense[(0, 1)], 1.);

        assert_eq!(
            matrix.windowed(&names(&["A", "Z"]), &window),
            Err(PortfolioError::UnknownAsset("Z".into()))
        );
    }

    #[test]
    fn test_rejects_ragged_rows() {
        let result = ReturnMatrix::new(names(&["A", "B"]), vec![row(1, &[Some(0.1)])]);
        assert!(matches!(
            result,
            Err(PortfolioError::DimensionMismatch {
                expected: 2,
                actual: 1,
                ..
            })
        ));
    }
}
