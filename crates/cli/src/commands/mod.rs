//! CLI command implementations

pub mod sample;
pub mod stream;

pub use sample::SampleCommand;
pub use stream::StreamCommand;

use crate::CliResult;
use pii_sampler::classification::{Classifier, PatternClassifier};
use pii_sampler::sampling::PayloadDecoder;
use pii_sampler::schema::{HttpSchemaRegistry, SchemaTagger};
use pii_sampler::{CancellationFlag, SamplerError};
use pii_sampler_config::SamplerConfig;
use std::sync::Arc;
use tracing::{info, warn};

/// Pattern classifier restricted to `pii_detection.enabled_types`
pub fn build_classifier(config: &SamplerConfig) -> CliResult<Arc<dyn Classifier>> {
    let classifier = PatternClassifier::new(&config.pii_detection.enabled_types)
        .map_err(SamplerError::from)?;
    Ok(Arc::new(classifier))
}

/// Schema tagger, when tagging is enabled and a registry is configured
pub fn build_tagger(config: &SamplerConfig) -> CliResult<Option<SchemaTagger>> {
    if !config.tagging.enabled {
        return Ok(None);
    }
    match HttpSchemaRegistry::from_config(&config.schema_registry)? {
        Some(registry) => Ok(Some(SchemaTagger::new(Arc::new(registry)))),
        None => {
            warn!("Tagging enabled without schema_registry.url; tags will not be written");
            Ok(None)
        }
    }
}

/// Payload decoder; Avro records are decoded whenever a registry url is set
pub fn build_decoder(config: &SamplerConfig) -> CliResult<PayloadDecoder> {
    Ok(match HttpSchemaRegistry::from_config(&config.schema_registry)? {
        Some(registry) => PayloadDecoder::with_registry(Arc::new(registry)),
        None => PayloadDecoder::json(),
    })
}

/// Cancel `flag` on the first Ctrl-C.
pub fn cancel_on_ctrl_c(flag: CancellationFlag) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested, finishing in-flight work");
                flag.cancel();
            }
            Err(e) => warn!(error = %e, "Unable to listen for Ctrl-C"),
        }
    });
}
