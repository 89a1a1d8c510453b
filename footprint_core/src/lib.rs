pub mod config;
pub mod csv_writer;
pub mod excel;
pub mod formatting;
pub mod gap;
pub mod geo_utils;
pub mod model;
mod model_impls;
pub mod outlier;
pub mod pipeline;
pub mod point_reader;
pub mod runner;
pub mod stay;
pub mod store;
pub mod task;
pub mod transport;
pub mod trip;
