pub mod implied_returns;
pub mod objective;
pub mod portfolio_evolution;
