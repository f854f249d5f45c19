// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Common utilities for configuration files shared by the pieces built on top of
//! this crate.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::result::Result;

use std::time::Duration;

use opcua_types::{ApplicationDescription, ApplicationType, DecodingOptions, LocalizedText, UAString};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelParams;
use crate::retry::{DefaultRetryPolicy, ExponentialBackoff};

/// Error returned from saving or loading config objects.
#[derive(Debug)]
pub enum ConfigError {
    /// Configuration is invalid, with a list of validation errors.
    ConfigInvalid(Vec<String>),
    /// Reading or writing file failed.
    IO(std::io::Error),
    /// Failed to serialize or deserialize config object.
    Yaml(serde_yaml::Error),
}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::IO(value)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Yaml(value)
    }
}

/// A trait that handles the loading, saving and validity checking of configuration
/// information for anything built on top of this crate.
pub trait Config: serde::Serialize {
    /// Save the configuration object to a file.
    fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Err(e) = self.validate() {
            return Err(ConfigError::ConfigInvalid(e));
        }
        let s = serde_yaml::to_string(&self)?;
        let mut f = File::create(path)?;
        f.write_all(s.as_bytes())?;
        Ok(())
    }

    /// Load the configuration object from the given path.
    fn load<A>(path: &Path) -> Result<A, ConfigError>
    where
        for<'de> A: Config + serde::Deserialize<'de>,
    {
        let mut f = File::open(path)?;
        let mut s = String::new();
        f.read_to_string(&mut s)?;
        Ok(serde_yaml::from_str(&s)?)
    }

    /// Validate the config struct, returning a list of validation errors if it fails.
    fn validate(&self) -> Result<(), Vec<String>>;

    /// Get the application name.
    fn application_name(&self) -> UAString;

    /// Get the application URI.
    fn application_uri(&self) -> UAString;

    /// Get the configured product URI.
    fn product_uri(&self) -> UAString;

    /// Get the application type.
    fn application_type(&self) -> ApplicationType;

    /// Get the registered discovery URLs for this application.
    fn discovery_urls(&self) -> Option<Vec<UAString>> {
        None
    }

    /// Create an application description for the configured application.
    fn application_description(&self) -> ApplicationDescription {
        ApplicationDescription {
            application_uri: self.application_uri(),
            application_name: LocalizedText::new("", self.application_name().as_ref()),
            application_type: self.application_type(),
            product_uri: self.product_uri(),
            gateway_server_uri: UAString::null(),
            discovery_profile_uri: UAString::null(),
            discovery_urls: self.discovery_urls(),
        }
    }
}

/// Configuration for a client-side secure channel stack: just the fields this
/// crate's own constructors need, not the broader session/subscription surface
/// configured elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureChannelConfig {
    /// Application name, sent in the `OpenSecureChannelRequest`'s implied
    /// `ApplicationDescription` and used by the PKI layer.
    pub application_name: String,
    /// Application URI, must match the URI embedded in the client certificate.
    pub application_uri: String,
    /// Product URI.
    pub product_uri: String,
    /// Directory holding the client's certificate, private key and trust lists.
    pub pki_dir: String,
    /// Channel lifetime requested in each `OpenSecureChannelRequest`, in milliseconds.
    pub channel_lifetime_ms: u32,
    /// Largest overall message size this client will construct or accept, in bytes.
    pub max_message_size: usize,
    /// Largest number of chunks a single inbound message may be split into.
    pub max_chunk_count: usize,
    /// Size of the buffer used to receive chunks, in bytes.
    pub receive_buffer_size: usize,
    /// Initial delay, in milliseconds, before the first reconnect attempt.
    pub retry_initial_delay_ms: u64,
    /// Ceiling, in milliseconds, the reconnect backoff will not exceed.
    pub retry_max_delay_ms: u64,
    /// Maximum number of reconnect attempts before giving up.
    pub retry_max_attempts: u32,
}

impl SecureChannelConfig {
    /// Build the [`ChannelParams`] this configuration describes.
    pub fn channel_params(&self) -> ChannelParams {
        ChannelParams {
            decoding_options: DecodingOptions {
                max_message_size: self.max_message_size,
                max_chunk_count: self.max_chunk_count,
                ..Default::default()
            },
            local_max_chunk_count: self.max_chunk_count,
            local_receive_buffer_size: self.receive_buffer_size,
            remote_max_message_size: self.max_message_size,
            max_chunk_size: 8192,
            requested_lifetime: self.channel_lifetime_ms,
        }
    }

    /// Build a fresh [`DefaultRetryPolicy`] from the configured backoff parameters.
    pub fn retry_policy(&self) -> DefaultRetryPolicy<'static> {
        DefaultRetryPolicy::new(ExponentialBackoff::new(
            Duration::from_millis(self.retry_initial_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
            self.retry_max_attempts,
        ))
    }
}

impl Config for SecureChannelConfig {
    fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.application_name.is_empty() {
            errors.push("application_name must not be empty".into());
        }
        if self.application_uri.is_empty() {
            errors.push("application_uri must not be empty".into());
        }
        if self.max_chunk_count != 0 && self.receive_buffer_size == 0 {
            errors.push("receive_buffer_size must not be 0 when max_chunk_count is bounded".into());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn application_name(&self) -> UAString {
        UAString::from(self.application_name.as_str())
    }

    fn application_uri(&self) -> UAString {
        UAString::from(self.application_uri.as_str())
    }

    fn product_uri(&self) -> UAString {
        UAString::from(self.product_uri.as_str())
    }

    fn application_type(&self) -> ApplicationType {
        ApplicationType::Client
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> SecureChannelConfig {
        SecureChannelConfig {
            application_name: "test client".into(),
            application_uri: "urn:test:client".into(),
            product_uri: "urn:test:product".into(),
            pki_dir: "./pki".into(),
            channel_lifetime_ms: 60 * 60 * 1000,
            max_message_size: 2 * 1024 * 1024,
            max_chunk_count: 64,
            receive_buffer_size: 64 * 1024,
            retry_initial_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            retry_max_attempts: 10,
        }
    }

    #[test]
    fn validate_rejects_an_empty_application_name() {
        let mut config = sample_config();
        config.application_name.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_a_well_formed_config() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn channel_params_carries_the_configured_limits() {
        let config = sample_config();
        let params = config.channel_params();
        assert_eq!(params.remote_max_message_size, config.max_message_size);
        assert_eq!(params.local_max_chunk_count, config.max_chunk_count);
        assert_eq!(params.requested_lifetime, config.channel_lifetime_ms);
    }

    #[test]
    fn retry_policy_backs_off_on_a_transient_status() {
        use crate::retry::RequestRetryPolicy;
        use opcua_types::status_code::StatusCode;

        let mut policy = sample_config().retry_policy();
        assert!(policy.next_delay(StatusCode::BadCommunicationError).is_some());
    }
}
