//! Runtime settings

use std::time::Duration;

use thiserror::Error;

use crate::config::{CliArgs, cli::Command};
use crate::core::{
    error::CredentialError,
    types::{ProvisioningContext, sanitize_group_name},
};

/// Shortest group name the lamp firmware accepts
pub const MIN_GROUP_NAME_LEN: usize = 2;

/// WPA passphrase minimum
pub const MIN_PASSWORD_LEN: usize = 8;

/// Rejected `provision` inputs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("Group name needs at least {} characters from [A-Za-z0-9_-]", MIN_GROUP_NAME_LEN)]
    GroupNameTooShort,

    #[error("WiFi password needs at least {} characters", MIN_PASSWORD_LEN)]
    PasswordTooShort,

    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

/// What the binary was asked to do
#[derive(Debug, Clone)]
pub enum Action {
    Scan {
        window: Duration,
        first: bool,
        json: bool,
    },
    Provision(ProvisionSettings),
}

/// Inputs of the `provision` command, still unvalidated
#[derive(Clone)]
pub struct ProvisionSettings {
    pub ssid: String,
    pub password: String,
    pub group: String,
    pub device: Option<String>,
    pub scan_window: Duration,
    pub timeout: Duration,
    pub max_scan_attempts: u32,
}

impl std::fmt::Debug for ProvisionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionSettings")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .field("group", &self.group)
            .field("device", &self.device)
            .field("scan_window", &self.scan_window)
            .field("timeout", &self.timeout)
            .field("max_scan_attempts", &self.max_scan_attempts)
            .finish()
    }
}

impl ProvisionSettings {
    /// Build the credentials for the lamp, applying the entry rules of the lamp app
    pub fn context(&self) -> Result<ProvisioningContext, SettingsError> {
        let group = sanitize_group_name(&self.group);
        if group.chars().count() < MIN_GROUP_NAME_LEN {
            return Err(SettingsError::GroupNameTooShort);
        }

        let ctx = ProvisioningContext::new(group, &self.ssid, &self.password)?;
        if ctx.password().chars().count() < MIN_PASSWORD_LEN {
            return Err(SettingsError::PasswordTooShort);
        }
        Ok(ctx)
    }
}

/// Runtime configuration settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub adapter: Option<String>,
    pub name_prefix: String,
    pub action: Action,
}

impl From<CliArgs> for Settings {
    fn from(args: CliArgs) -> Self {
        let action = match args.command {
            Command::Scan {
                window_secs,
                first,
                json,
            } => Action::Scan {
                window: Duration::from_secs(window_secs),
                first,
                json,
            },
            Command::Provision {
                ssid,
                password,
                group,
                device,
                scan_window_secs,
                timeout_secs,
                max_scan_attempts,
            } => Action::Provision(ProvisionSettings {
                ssid,
                password,
                group,
                device,
                scan_window: Duration::from_secs(scan_window_secs),
                timeout: Duration::from_secs(timeout_secs),
                max_scan_attempts: max_scan_attempts.max(1),
            }),
        };

        Settings {
            adapter: args.adapter,
            name_prefix: args.filter,
            action,
        }
    }
}
