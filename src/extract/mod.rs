pub mod circuit_breaker;
pub mod extractor;
pub mod normalize;
pub mod provider;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use extractor::{Extractor, ExtractorConfig, RawBatch};
pub use normalize::normalize_point;
pub use provider::{ForecastProvider, HttpForecastProvider};
