// src/error.rs
use std::fmt;

#[derive(Debug)]
pub enum PointError {
    InvalidAmount,
    Cache(String),
    Storage(String),
    Config(String),
}

impl fmt::Display for PointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAmount => write!(f, "Invalid amount"),
            Self::Cache(msg) => write!(f, "Cache error: {}", msg),
            Self::Storage(msg) => write!(f, "Storage error: {}", msg),
            Self::Config(msg) => write!(f, "Config error: {}", msg),
        }
    }
}

impl std::error::Error for PointError {}
