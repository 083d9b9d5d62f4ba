pub mod api;
pub mod model;
pub mod store;

pub use model::{FixedCost, FlowEstimate, PricingBreakdown, PricingConfig, RolloutInterval};
pub use store::{
    PgPricingConfigRepository, PricingConfigRepository, PricingConfigStore, StoredPricingConfig,
};
