pub mod backtest;
pub mod broker;
pub mod market;
pub mod strategy;
pub mod trading;

pub use backtest::*;
pub use broker::*;
pub use market::*;
pub use strategy::*;
pub use trading::*;
