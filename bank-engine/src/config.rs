use bank_core::Amount;
use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub bank: BankConfig,
    pub tan: TanConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BankConfig {
    pub name: String,
    pub base_url: Option<String>,
    /// Regional currency; every ledger amount carries this tag.
    pub currency: String,
    /// Fiat currency for cashin/cashout. Conversion is enabled iff set.
    pub fiat_currency: Option<String>,
    pub allow_registrations: bool,
    pub allow_deletions: bool,
    pub allow_edit_name: bool,
    pub allow_edit_cashout_payto_uri: bool,
    pub registration_bonus: Option<Amount>,
    pub default_debit_threshold: Amount,
    /// `iban` or `x-taler-bank`; decides how internal paytos are allocated.
    pub wire_type: String,
    /// Hostname used in generated x-taler-bank paytos.
    pub hostname: String,
    /// Country prefix for generated IBANs.
    pub iban_country: String,
    /// Initial password for the seeded `admin` account.
    pub admin_password: Option<String>,
    /// Default bearer-token lifetime when the client sends no duration.
    pub token_duration_hours: i64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TanConfig {
    pub sms_script: Option<String>,
    pub email_script: Option<String>,
    #[serde(default)]
    pub sms_env: HashMap<String, String>,
    #[serde(default)]
    pub email_env: HashMap<String, String>,
    pub code_retries: u32,
    pub validity_minutes: i64,
    pub retransmission_seconds: i64,
    /// Whether an authenticated admin may skip TAN confirmation.
    pub admin_exempt: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.workers", 4)?
            .set_default("database.max_connections", 10)?
            .set_default("bank.name", "Regional Bank")?
            .set_default("bank.allow_registrations", true)?
            .set_default("bank.allow_deletions", true)?
            .set_default("bank.allow_edit_name", false)?
            .set_default("bank.allow_edit_cashout_payto_uri", false)?
            .set_default("bank.default_debit_threshold", "KUDOS:0")?
            .set_default("bank.currency", "KUDOS")?
            .set_default("bank.wire_type", "iban")?
            .set_default("bank.hostname", "bank.example.com")?
            .set_default("bank.iban_country", "CH")?
            .set_default("bank.token_duration_hours", 24)?
            .set_default("tan.code_retries", 3)?
            .set_default("tan.validity_minutes", 60)?
            .set_default("tan.retransmission_seconds", 10)?
            .set_default("tan.admin_exempt", true)?;

        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder =
                builder.add_source(File::with_name(&format!("config/{}", environment)).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("BANK")
                .separator("__")
                .list_separator(","),
        );

        if let Ok(db_url) = env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", db_url)?;
        }

        if let Ok(port) = env::var("BANK_PORT") {
            builder = builder.set_override("server.port", port)?;
        }

        if let Ok(password) = env::var("BANK_ADMIN_PASSWORD") {
            builder = builder.set_override("bank.admin_password", password)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }
        if self.database.url.is_empty() {
            return Err("Database URL is required".to_string());
        }
        if Amount::zero(&self.bank.currency).is_err() {
            return Err(format!("Invalid regional currency {:?}", self.bank.currency));
        }
        if let Some(fiat) = &self.bank.fiat_currency {
            if Amount::zero(fiat).is_err() {
                return Err(format!("Invalid fiat currency {:?}", fiat));
            }
            if fiat == &self.bank.currency {
                return Err("Fiat and regional currency must differ".to_string());
            }
        }
        if self.bank.default_debit_threshold.currency() != self.bank.currency {
            return Err("default_debit_threshold must be in the regional currency".to_string());
        }
        if let Some(bonus) = &self.bank.registration_bonus {
            if bonus.currency() != self.bank.currency {
                return Err("registration_bonus must be in the regional currency".to_string());
            }
        }
        match self.bank.wire_type.as_str() {
            "iban" | "x-taler-bank" => {}
            other => return Err(format!("Unsupported wire_type {:?}", other)),
        }
        Ok(())
    }

    pub fn conversion_enabled(&self) -> bool {
        self.bank.fiat_currency.is_some()
    }

    /// TAN channels that actually have a delivery script configured.
    pub fn supported_tan_channels(&self) -> Vec<&'static str> {
        let mut channels = Vec::new();
        if self.tan.sms_script.is_some() {
            channels.push("sms");
        }
        if self.tan.email_script.is_some() {
            channels.push("email");
        }
        channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                workers: 2,
            },
            database: DatabaseConfig {
                url: "postgres://localhost/bank".to_string(),
                max_connections: 5,
            },
            bank: BankConfig {
                name: "Test Bank".to_string(),
                base_url: None,
                currency: "KUDOS".to_string(),
                fiat_currency: None,
                allow_registrations: true,
                allow_deletions: true,
                allow_edit_name: false,
                allow_edit_cashout_payto_uri: false,
                registration_bonus: None,
                default_debit_threshold: "KUDOS:0".parse().unwrap(),
                wire_type: "iban".to_string(),
                hostname: "bank.test".to_string(),
                iban_country: "CH".to_string(),
                admin_password: Some("secret".to_string()),
                token_duration_hours: 24,
            },
            tan: TanConfig {
                sms_script: None,
                email_script: None,
                sms_env: HashMap::new(),
                email_env: HashMap::new(),
                code_retries: 3,
                validity_minutes: 60,
                retransmission_seconds: 10,
                admin_exempt: true,
            },
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn currency_mismatches_rejected() {
        let mut config = base_config();
        config.bank.registration_bonus = Some("EUR:10".parse().unwrap());
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.bank.fiat_currency = Some("KUDOS".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn wire_type_checked() {
        let mut config = base_config();
        config.bank.wire_type = "ach".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn tan_channels_follow_scripts() {
        let mut config = base_config();
        assert!(config.supported_tan_channels().is_empty());
        config.tan.sms_script = Some("/usr/local/bin/send-sms".to_string());
        assert_eq!(config.supported_tan_channels(), vec!["sms"]);
    }
}
