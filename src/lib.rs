pub mod accuracy;
pub mod calibration;
pub mod confidence;
pub mod config;
pub mod context;
pub mod cross_validation;
pub mod data_quality;
pub mod ensemble;
pub mod error;
pub mod features;
pub mod meta_learner;
pub mod model;
pub mod persist;
pub mod predictors;
pub mod recorder;
pub mod service;
pub mod weighting;

pub use ensemble::{Ensemble, EnsembleMethod, EnsembleResult, GameType};
pub use error::EnsembleError;
pub use features::FeatureVector;
pub use model::{ModelResult, Predictor, Score};
