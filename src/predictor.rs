//! Client for the optional failure-prediction service.
//!
//! The predictor is advisory: any transport error, timeout, or non-2xx
//! response is treated as approval (fail open) by the dispatch path, so a
//! down predictor never stops jobs.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SkeeError};

#[derive(Debug, Clone, Serialize)]
pub struct PredictionFeatures {
    pub day_of_week: u32,
    pub hour: u32,
    pub job_type: String,
}

#[derive(Debug, Serialize)]
struct PredictionRequest<'a> {
    job_id: &'a str,
    features: &'a PredictionFeatures,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Prediction {
    pub job_id: String,
    pub failure_probability: f64,
    pub confidence: f64,
    pub decision: String,
}

impl Prediction {
    pub fn is_abort(&self) -> bool {
        self.decision == "ABORT"
    }
}

#[async_trait]
pub trait FailurePredictor: Send + Sync {
    async fn predict_failure(
        &self,
        job_id: &str,
        features: &PredictionFeatures,
    ) -> Result<Prediction>;
}

pub struct HttpPredictor {
    base_url: String,
    client: reqwest::Client,
}

impl HttpPredictor {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            base_url: base_url.into(),
            client,
        }
    }
}

#[async_trait]
impl FailurePredictor for HttpPredictor {
    async fn predict_failure(
        &self,
        job_id: &str,
        features: &PredictionFeatures,
    ) -> Result<Prediction> {
        let url = format!("{}/predict/failure", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&PredictionRequest { job_id, features })
            .send()
            .await
            .map_err(|e| SkeeError::Predictor(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SkeeError::Predictor(format!(
                "predictor returned status {}",
                response.status()
            )));
        }

        response
            .json::<Prediction>()
            .await
            .map_err(|e| SkeeError::Predictor(e.to_string()))
    }
}
