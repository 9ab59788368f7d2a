pub mod attributes;
pub mod config;
pub mod convert;
pub mod directory;
pub mod domain;
pub mod error;
pub mod fhir;
pub mod merge;
pub mod outcome;
pub mod output;
pub mod reporting;
pub mod star_model;
pub mod sync;
