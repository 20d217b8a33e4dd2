pub mod forecast_analyzer;

pub use forecast_analyzer::{
    write_csv, DailyAggregate, DatasetSummary, ForecastAnalyzer, QueryFilter, TimeSeriesPoint,
};
