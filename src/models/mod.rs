pub mod indicator;
pub mod order;
pub mod position;
pub mod session;
pub mod signal;
pub mod strategy;
pub mod tick;

pub use indicator::{IndicatorScope, IndicatorValue, IndicatorVariant};
pub use order::{Order, OrderSide, OrderStatus, OrderType};
pub use position::{Position, PositionStatus};
pub use session::{BudgetConfig, Session, SessionConfig, SessionMode, SessionStatus, StrategyAllocation};
pub use signal::{Signal, SignalKind};
pub use strategy::{
    Condition, Direction, EmergencyActions, EmergencyExit, Logic, O1Cancel, Operator, PositionSizing,
    RiskAdjustedPct, RiskScaling, S1Signal, SizingType, StrategyConfig, StrategyInstance, StrategyState,
    Z1Entry, Ze1Close,
};
pub use tick::{MarketTick, Tick};
