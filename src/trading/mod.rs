//! Trading logic: risk configuration, position sizing, exit state machine.

mod config;
mod exit_engine;
mod position_sizer;

pub use config::{CostConfig, RiskConfig, Side};
pub use exit_engine::{trading_days_held, ExitAction, ExitEngine, ExitState, Observation, Transition};
pub use position_sizer::{risk_quantity, PositionSizer, SizingRejection};

pub(crate) use position_sizer::floor_quantity;
