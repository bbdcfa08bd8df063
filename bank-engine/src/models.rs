//! Wire-facing data types for all four API surfaces.

use bank_core::conversion::ConversionRate;
use bank_core::{Amount, PaytoUri};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

/// Taler protocol timestamp: `{"t_s": <seconds>}` or `{"t_s": "never"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp(pub Option<DateTime<Utc>>);

impl Timestamp {
    pub fn from(dt: DateTime<Utc>) -> Self {
        Timestamp(Some(dt))
    }

    pub fn never() -> Self {
        Timestamp(None)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("Timestamp", 1)?;
        match self.0 {
            Some(dt) => s.serialize_field("t_s", &dt.timestamp())?,
            None => s.serialize_field("t_s", "never")?,
        }
        s.end()
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            t_s: serde_json::Value,
        }
        let raw = Raw::deserialize(deserializer)?;
        match raw.t_s {
            serde_json::Value::String(s) if s == "never" => Ok(Timestamp::never()),
            serde_json::Value::Number(n) => {
                let secs = n
                    .as_i64()
                    .ok_or_else(|| de::Error::custom("timestamp out of range"))?;
                Utc.timestamp_opt(secs, 0)
                    .single()
                    .map(Timestamp::from)
                    .ok_or_else(|| de::Error::custom("timestamp out of range"))
            }
            _ => Err(de::Error::custom("expected seconds or \"never\"")),
        }
    }
}

/// Taler relative time: `{"d_us": <microseconds>}` or `{"d_us": "forever"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelativeTime(pub Option<Duration>);

impl<'de> Deserialize<'de> for RelativeTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            d_us: serde_json::Value,
        }
        let raw = Raw::deserialize(deserializer)?;
        match raw.d_us {
            serde_json::Value::String(s) if s == "forever" => Ok(RelativeTime(None)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .filter(|us| *us >= 0)
                .map(|us| RelativeTime(Some(Duration::microseconds(us))))
                .ok_or_else(|| de::Error::custom("duration out of range")),
            _ => Err(de::Error::custom("expected microseconds or \"forever\"")),
        }
    }
}

/// Tri-state PATCH field: absent leaves the value unchanged, JSON `null`
/// clears it, a value sets it. Fields of this type must carry
/// `#[serde(default)]` so absence maps to `Keep`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchField<T> {
    Keep,
    Clear,
    Set(T),
}

impl<T> Default for PatchField<T> {
    fn default() -> Self {
        PatchField::Keep
    }
}

impl<T> PatchField<T> {
    /// Resolve against the current value.
    pub fn apply(self, current: Option<T>) -> Option<T> {
        match self {
            PatchField::Keep => current,
            PatchField::Clear => None,
            PatchField::Set(v) => Some(v),
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, PatchField::Keep)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for PatchField<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(v) => PatchField::Set(v),
            None => PatchField::Clear,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TanChannel {
    Sms,
    Email,
}

impl fmt::Display for TanChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TanChannel::Sms => f.write_str("sms"),
            TanChannel::Email => f.write_str("email"),
        }
    }
}

impl FromStr for TanChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sms" => Ok(TanChannel::Sms),
            "email" => Ok(TanChannel::Email),
            other => Err(format!("unknown TAN channel {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenScope {
    ReadOnly,
    ReadWrite,
    Refreshable,
}

impl fmt::Display for TokenScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenScope::ReadOnly => f.write_str("readonly"),
            TokenScope::ReadWrite => f.write_str("readwrite"),
            TokenScope::Refreshable => f.write_str("refreshable"),
        }
    }
}

impl FromStr for TokenScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "readonly" => Ok(TokenScope::ReadOnly),
            "readwrite" => Ok(TokenScope::ReadWrite),
            "refreshable" => Ok(TokenScope::Refreshable),
            other => Err(format!("unknown token scope {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Core bank API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactData {
    #[serde(default)]
    pub email: PatchField<String>,
    #[serde(default)]
    pub phone: PatchField<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterAccountRequest {
    #[validate(length(min = 1, max = 64))]
    pub username: String,
    #[validate(length(min = 1, max = 128))]
    pub password: String,
    pub name: String,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub is_taler_exchange: bool,
    #[serde(default)]
    pub contact_data: Option<ContactData>,
    pub payto_uri: Option<PaytoUri>,
    pub cashout_payto_uri: Option<PaytoUri>,
    pub debit_threshold: Option<Amount>,
    pub min_cashout: Option<Amount>,
    pub tan_channel: Option<TanChannel>,
}

#[derive(Debug, Serialize)]
pub struct RegisterAccountResponse {
    pub internal_payto_uri: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct AccountReconfiguration {
    #[serde(default)]
    pub contact_data: Option<ContactData>,
    #[serde(default)]
    pub cashout_payto_uri: PatchField<PaytoUri>,
    pub name: Option<String>,
    pub is_public: Option<bool>,
    pub debit_threshold: Option<Amount>,
    #[serde(default)]
    pub min_cashout: PatchField<Amount>,
    #[serde(default)]
    pub tan_channel: PatchField<TanChannel>,
}

#[derive(Debug, Deserialize)]
pub struct AccountPasswordChange {
    pub new_password: String,
    pub old_password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CreditDebitIndicator {
    Credit,
    Debit,
}

#[derive(Debug, Serialize)]
pub struct BalanceJson {
    pub amount: Amount,
    pub credit_debit_indicator: CreditDebitIndicator,
}

#[derive(Debug, Serialize)]
pub struct AccountData {
    pub username: String,
    pub name: String,
    pub payto_uri: String,
    pub balance: BalanceJson,
    pub debit_threshold: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_cashout: Option<Amount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_data: Option<ContactDataResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cashout_payto_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tan_channel: Option<TanChannel>,
    pub is_public: bool,
    pub is_taler_exchange: bool,
}

#[derive(Debug, Serialize)]
pub struct ContactDataResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PublicAccount {
    pub username: String,
    pub payto_uri: String,
    pub balance: BalanceJson,
    pub is_taler_exchange: bool,
}

#[derive(Debug, Serialize)]
pub struct PublicAccountsResponse {
    pub public_accounts: Vec<PublicAccount>,
}

#[derive(Debug, Serialize)]
pub struct ListBankAccountsResponse {
    pub accounts: Vec<AccountMinimalData>,
}

#[derive(Debug, Serialize)]
pub struct AccountMinimalData {
    pub username: String,
    pub name: String,
    pub payto_uri: String,
    pub balance: BalanceJson,
    pub debit_threshold: Amount,
    pub is_public: bool,
    pub is_taler_exchange: bool,
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub scope: TokenScope,
    pub duration: Option<RelativeTime>,
    #[serde(default)]
    pub refreshable: bool,
}

#[derive(Debug, Serialize)]
pub struct TokenSuccessResponse {
    pub access_token: String,
    pub expiration: Timestamp,
}

#[derive(Debug, Deserialize)]
pub struct CreateTransactionRequest {
    /// Creditor payto; `message` (subject) and optionally `amount` ride in
    /// the query parameters.
    pub payto_uri: String,
    pub amount: Option<Amount>,
    pub request_uid: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateTransactionResponse {
    pub row_id: i64,
}

#[derive(Debug, Serialize)]
pub struct BankAccountTransactionInfo {
    pub creditor_payto_uri: String,
    pub debtor_payto_uri: String,
    pub amount: Amount,
    pub direction: CreditDebitIndicator,
    pub subject: String,
    pub row_id: i64,
    pub date: Timestamp,
}

#[derive(Debug, Serialize)]
pub struct BankAccountTransactionsResponse {
    pub transactions: Vec<BankAccountTransactionInfo>,
}

/// Cursor parameters shared by every history endpoint.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HistoryParams {
    pub start: Option<i64>,
    pub delta: Option<i64>,
    pub long_poll_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Withdrawals
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct BankAccountCreateWithdrawalRequest {
    pub amount: Amount,
}

#[derive(Debug, Serialize)]
pub struct BankAccountCreateWithdrawalResponse {
    pub withdrawal_id: Uuid,
    pub taler_withdraw_uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalState {
    Pending,
    Selected,
    Aborted,
    Confirmed,
}

impl fmt::Display for WithdrawalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WithdrawalState::Pending => f.write_str("pending"),
            WithdrawalState::Selected => f.write_str("selected"),
            WithdrawalState::Aborted => f.write_str("aborted"),
            WithdrawalState::Confirmed => f.write_str("confirmed"),
        }
    }
}

impl FromStr for WithdrawalState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WithdrawalState::Pending),
            "selected" => Ok(WithdrawalState::Selected),
            "aborted" => Ok(WithdrawalState::Aborted),
            "confirmed" => Ok(WithdrawalState::Confirmed),
            other => Err(format!("unknown withdrawal state {other:?}")),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WithdrawalStatus {
    pub status: WithdrawalState,
    pub amount: Amount,
    pub username: String,
    pub sender_wire: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_exchange_account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_reserve_pub: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WithdrawalPollParams {
    pub long_poll_ms: Option<u64>,
    /// Only return once the state differs from this one (or on timeout).
    pub old_state: Option<WithdrawalState>,
}

/// Wallet-side selection (integration API).
#[derive(Debug, Deserialize)]
pub struct BankWithdrawalOperationPostRequest {
    pub reserve_pub: String,
    pub selected_exchange: PaytoUri,
}

#[derive(Debug, Serialize)]
pub struct BankWithdrawalOperationPostResponse {
    pub status: WithdrawalState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm_transfer_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Cashouts
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CashoutRequest {
    pub request_uid: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub amount_debit: Amount,
    pub amount_credit: Amount,
}

#[derive(Debug, Serialize)]
pub struct CashoutResponse {
    pub cashout_id: i64,
}

#[derive(Debug, Serialize)]
pub struct CashoutStatusResponse {
    pub status: String,
    pub amount_debit: Amount,
    pub amount_credit: Amount,
    pub subject: String,
    pub creation_time: Timestamp,
}

#[derive(Debug, Serialize)]
pub struct Cashouts {
    pub cashouts: Vec<CashoutInfo>,
}

#[derive(Debug, Serialize)]
pub struct CashoutInfo {
    pub cashout_id: i64,
    pub username: String,
}

// ---------------------------------------------------------------------------
// Challenges
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct TanTransmission {
    pub challenge_id: i64,
    pub tan_channel: TanChannel,
    /// Obfuscated destination, e.g. a masked phone number.
    pub tan_info: String,
}

#[derive(Debug, Deserialize)]
pub struct ChallengeSolveRequest {
    pub tan: String,
}

// ---------------------------------------------------------------------------
// Wire gateway
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Validate)]
pub struct TransferRequest {
    #[validate(length(min = 1, max = 128))]
    pub request_uid: String,
    pub amount: Amount,
    pub exchange_base_url: String,
    pub wtid: String,
    pub credit_account: PaytoUri,
}

#[derive(Debug, Serialize)]
pub struct TransferResponse {
    pub row_id: i64,
    pub timestamp: Timestamp,
}

#[derive(Debug, Deserialize)]
pub struct AddIncomingRequest {
    pub amount: Amount,
    pub reserve_pub: String,
    pub debit_account: PaytoUri,
}

#[derive(Debug, Serialize)]
pub struct AddIncomingResponse {
    pub row_id: i64,
    pub timestamp: Timestamp,
}

#[derive(Debug, Serialize)]
pub struct IncomingBankTransaction {
    pub row_id: i64,
    pub date: Timestamp,
    pub amount: Amount,
    pub debit_account: String,
    pub reserve_pub: String,
}

#[derive(Debug, Serialize)]
pub struct IncomingHistory {
    pub incoming_transactions: Vec<IncomingBankTransaction>,
    pub credit_account: String,
}

#[derive(Debug, Serialize)]
pub struct OutgoingBankTransaction {
    pub row_id: i64,
    pub date: Timestamp,
    pub amount: Amount,
    pub credit_account: String,
    pub wtid: String,
    pub exchange_base_url: String,
}

#[derive(Debug, Serialize)]
pub struct OutgoingHistory {
    pub outgoing_transactions: Vec<OutgoingBankTransaction>,
    pub debit_account: String,
}

#[derive(Debug, Serialize)]
pub struct WireGatewayConfig {
    pub name: &'static str,
    pub version: &'static str,
    pub currency: String,
}

// ---------------------------------------------------------------------------
// Revenue API
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct RevenueConfig {
    pub name: &'static str,
    pub version: &'static str,
    pub currency: String,
}

#[derive(Debug, Serialize)]
pub struct RevenueIncomingBankTransaction {
    pub row_id: i64,
    pub date: Timestamp,
    pub amount: Amount,
    pub debit_account: String,
    pub subject: String,
}

#[derive(Debug, Serialize)]
pub struct RevenueIncomingHistory {
    pub incoming_transactions: Vec<RevenueIncomingBankTransaction>,
    pub credit_account: String,
}

// ---------------------------------------------------------------------------
// /config and conversion info
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct CurrencySpecification {
    pub name: String,
    pub currency: String,
    pub num_fractional_input_digits: u32,
    pub num_fractional_normal_digits: u32,
    pub num_fractional_trailing_zero_digits: u32,
    pub alt_unit_names: serde_json::Value,
}

impl CurrencySpecification {
    pub fn default_for(currency: &str) -> Self {
        CurrencySpecification {
            name: currency.to_string(),
            currency: currency.to_string(),
            num_fractional_input_digits: 2,
            num_fractional_normal_digits: 2,
            num_fractional_trailing_zero_digits: 2,
            alt_unit_names: serde_json::json!({ "0": currency }),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BankConfigResponse {
    pub bank_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub currency: String,
    pub currency_specification: CurrencySpecification,
    pub allow_conversion: bool,
    pub allow_registrations: bool,
    pub allow_deletions: bool,
    pub allow_edit_name: bool,
    pub allow_edit_cashout_payto_uri: bool,
    pub default_debit_threshold: Amount,
    pub supported_tan_channels: Vec<&'static str>,
    pub wire_type: String,
}

#[derive(Debug, Serialize)]
pub struct ConversionInfoConfig {
    pub regional_currency: String,
    pub fiat_currency: String,
    pub conversion_rate: ConversionRate,
}

#[derive(Debug, Deserialize)]
pub struct ConversionRateQuery {
    pub amount_debit: Option<Amount>,
    pub amount_credit: Option<Amount>,
}

#[derive(Debug, Serialize)]
pub struct ConversionResponse {
    pub amount_debit: Amount,
    pub amount_credit: Amount,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_field_tri_state() {
        #[derive(Deserialize)]
        struct Probe {
            #[serde(default)]
            field: PatchField<String>,
        }

        let absent: Probe = serde_json::from_str("{}").unwrap();
        assert_eq!(absent.field, PatchField::Keep);

        let cleared: Probe = serde_json::from_str(r#"{"field": null}"#).unwrap();
        assert_eq!(cleared.field, PatchField::Clear);

        let set: Probe = serde_json::from_str(r#"{"field": "x"}"#).unwrap();
        assert_eq!(set.field, PatchField::Set("x".to_string()));
    }

    #[test]
    fn patch_field_apply() {
        assert_eq!(PatchField::Keep.apply(Some(1)), Some(1));
        assert_eq!(PatchField::<i32>::Clear.apply(Some(1)), None);
        assert_eq!(PatchField::Set(2).apply(Some(1)), Some(2));
    }

    #[test]
    fn timestamp_serde() {
        let ts = Timestamp::from(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, r#"{"t_s":1700000000}"#);
        let back: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ts);

        let never = serde_json::to_string(&Timestamp::never()).unwrap();
        assert_eq!(never, r#"{"t_s":"never"}"#);
        let back: Timestamp = serde_json::from_str(&never).unwrap();
        assert_eq!(back, Timestamp::never());
    }

    #[test]
    fn relative_time_parses_forever() {
        let rt: RelativeTime = serde_json::from_str(r#"{"d_us":"forever"}"#).unwrap();
        assert_eq!(rt, RelativeTime(None));
        let rt: RelativeTime = serde_json::from_str(r#"{"d_us":3600000000}"#).unwrap();
        assert_eq!(rt, RelativeTime(Some(Duration::hours(1))));
        assert!(serde_json::from_str::<RelativeTime>(r#"{"d_us":-5}"#).is_err());
    }

    #[test]
    fn scope_and_channel_round_trip_db_text() {
        for scope in [TokenScope::ReadOnly, TokenScope::ReadWrite, TokenScope::Refreshable] {
            assert_eq!(scope.to_string().parse::<TokenScope>().unwrap(), scope);
        }
        for channel in [TanChannel::Sms, TanChannel::Email] {
            assert_eq!(channel.to_string().parse::<TanChannel>().unwrap(), channel);
        }
    }

    #[test]
    fn register_request_minimal_json() {
        let req: RegisterAccountRequest = serde_json::from_str(
            r#"{"username": "alice", "password": "pw", "name": "Alice"}"#,
        )
        .unwrap();
        assert!(!req.is_public);
        assert!(!req.is_taler_exchange);
        assert!(req.payto_uri.is_none());
    }
}
