// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Runtime configuration.
//!
//! Settings are layered (later sources override earlier ones):
//! 1. built-in defaults
//! 2. `credit-ledger.yaml` in the current directory (if present)
//! 3. the file passed to [`Settings::load`] (if any)
//! 4. environment variables prefixed with `CREDIT_LEDGER__`, using `__` as
//!    the nesting separator (e.g. `CREDIT_LEDGER__CREDITS__SIGNUP_GRANT=5`)

use crate::order::{Package, default_catalog};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "credit-ledger.yaml";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CREDIT_LEDGER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CREDIT_LEDGER_LOG";

/// What to do when a refund claws back more credits than the account holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefundPolicy {
    /// Claw back what is there and report the shortfall.
    #[default]
    Clamp,
    /// Refuse the refund with `InsufficientCredits`.
    Strict,
}

/// Credit accounting rules.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CreditPolicy {
    /// Credits granted when an account is opened.
    pub signup_grant: Decimal,
    /// Credits consumed by one conversion attempt.
    pub credits_per_conversion: Decimal,
    pub refund_policy: RefundPolicy,
}

impl Default for CreditPolicy {
    fn default() -> Self {
        Self {
            signup_grant: dec!(3.00),
            credits_per_conversion: dec!(1.00),
            refund_policy: RefundPolicy::Clamp,
        }
    }
}

/// Payment webhook verification settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Shared signing secret issued by the payment gateway.
    pub secret: String,
    /// Maximum age of a signed delivery, in seconds.
    pub tolerance_secs: i64,
    /// How long applied event IDs are remembered, in seconds.
    pub event_retention_secs: i64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            tolerance_secs: 300,
            event_retention_secs: 7 * 24 * 60 * 60,
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub credits: CreditPolicy,
    pub webhook: WebhookConfig,
    /// Credit packages offered at checkout.
    pub packages: Vec<Package>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            credits: CreditPolicy::default(),
            webhook: WebhookConfig::default(),
            packages: default_catalog(),
        }
    }
}

impl Settings {
    /// Loads configuration from files and environment.
    ///
    /// # Errors
    ///
    /// Returns a [`config::ConfigError`] if an explicitly named file is
    /// missing or any source fails to parse.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        use config::{Config, Environment, File, FileFormat};

        let mut builder = Config::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn package(&self, code: &str) -> Option<&Package> {
        self.packages.iter().find(|p| p.code == code)
    }
}
