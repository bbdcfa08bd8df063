//! TAN code generation and out-of-band delivery.
//!
//! Delivery is an external script per channel: the recipient address is
//! passed as the single argument, the message text on stdin, and the
//! configured channel environment on top of the inherited one. A non-zero
//! exit status surfaces as HTTP 502.

use crate::config::TanConfig;
use crate::errors::{BankError, Result};
use crate::metrics;
use crate::models::TanChannel;
use bank_core::TalerErrorCode;
use rand::Rng;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

/// Length of a TAN code in decimal digits.
const CODE_DIGITS: u32 = 6;

pub fn generate_code() -> String {
    let code: u32 = rand::thread_rng().gen_range(0..10u32.pow(CODE_DIGITS));
    format!("{:06}", code)
}

/// Obfuscated recipient shown back to the client as `tan_info`.
pub fn mask_recipient(channel: TanChannel, recipient: &str) -> String {
    match channel {
        TanChannel::Email => match recipient.split_once('@') {
            Some((local, domain)) => match local.chars().next() {
                Some(first) => format!("{first}***@{domain}"),
                None => "***".to_string(),
            },
            _ => "***".to_string(),
        },
        TanChannel::Sms => {
            let tail: String = recipient
                .chars()
                .rev()
                .take(2)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            format!("***{}", tail)
        }
    }
}

pub async fn dispatch(
    config: &TanConfig,
    channel: TanChannel,
    recipient: &str,
    message: &str,
) -> Result<()> {
    let (script, env) = match channel {
        TanChannel::Sms => (&config.sms_script, &config.sms_env),
        TanChannel::Email => (&config.email_script, &config.email_env),
    };
    let script = script.as_ref().ok_or_else(|| {
        BankError::bad_request(
            TalerErrorCode::BankTanChannelNotSupported,
            format!("no delivery script configured for {channel}"),
        )
    })?;

    let mut child = Command::new(script)
        .arg(recipient)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BankError::TanScriptFailed(format!("spawn {script}: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(message.as_bytes())
            .await
            .map_err(|e| BankError::TanScriptFailed(format!("stdin: {e}")))?;
        // close stdin so the script sees EOF
        drop(stdin);
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| BankError::TanScriptFailed(format!("wait: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("TAN script {} failed ({}): {}", script, output.status, stderr.trim());
        metrics::TAN_SENDS_TOTAL
            .with_label_values(&[&channel.to_string(), "error"])
            .inc();
        return Err(BankError::TanScriptFailed(format!(
            "{script} exited with {}",
            output.status
        )));
    }

    info!("TAN code dispatched via {}", channel);
    metrics::TAN_SENDS_TOTAL
        .with_label_values(&[&channel.to_string(), "ok"])
        .inc();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_six_digits() {
        for _ in 0..100 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[test]
    fn masking_keeps_little() {
        assert_eq!(mask_recipient(TanChannel::Email, "alice@example.com"), "a***@example.com");
        assert_eq!(mask_recipient(TanChannel::Sms, "+41791234567"), "***67");
        assert_eq!(mask_recipient(TanChannel::Email, "broken"), "***");
    }

    #[tokio::test]
    async fn missing_script_is_channel_not_supported() {
        let config = TanConfig {
            sms_script: None,
            email_script: None,
            sms_env: Default::default(),
            email_env: Default::default(),
            code_retries: 3,
            validity_minutes: 60,
            retransmission_seconds: 10,
            admin_exempt: true,
        };
        let err = dispatch(&config, TanChannel::Sms, "+4179", "code").await.unwrap_err();
        assert_eq!(err.taler_code(), TalerErrorCode::BankTanChannelNotSupported);
    }

    #[tokio::test]
    async fn failing_script_maps_to_script_failed() {
        let config = TanConfig {
            sms_script: Some("/bin/false".to_string()),
            email_script: None,
            sms_env: Default::default(),
            email_env: Default::default(),
            code_retries: 3,
            validity_minutes: 60,
            retransmission_seconds: 10,
            admin_exempt: true,
        };
        let err = dispatch(&config, TanChannel::Sms, "+4179", "code").await.unwrap_err();
        assert_eq!(err.taler_code(), TalerErrorCode::BankTanChannelScriptFailed);
    }
}
