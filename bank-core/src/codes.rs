//! Subset of the GNU Taler error-code registry used by the bank.
//!
//! Error bodies on the wire carry the numeric code plus a hint; the
//! numeric values are the registry ones, never reused or renumbered.

use serde::{Serialize, Serializer};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
#[allow(clippy::enum_variant_names)]
pub enum TalerErrorCode {
    EndpointUnknown = 11,
    GenericJsonInvalid = 22,
    GenericPaytoUriMalformed = 23,
    GenericParameterMissing = 24,
    GenericMethodInvalid = 25,
    GenericParameterMalformed = 26,
    GenericCurrencyMismatch = 32,
    GenericUnauthorized = 40,
    GenericTokenUnknown = 41,
    GenericTokenExpired = 42,
    GenericTokenPermissionInsufficient = 43,
    GenericUploadExceedsLimit = 55,
    GenericInternalInvariantFailure = 60,

    BankSameAccount = 5101,
    BankUnallowedDebit = 5102,
    BankNegativeNumberAmount = 5103,
    BankNumberTooBig = 5104,
    BankTransactionNotFound = 5105,
    BankLoginFailed = 5106,
    BankUnknownAccount = 5109,
    BankAccountIsExchange = 5110,
    BankAccountIsNotExchange = 5111,
    BankBadFormatAmount = 5112,
    BankReserveSelectionConflict = 5113,
    BankDuplicateReservePubSubject = 5114,
    BankAccountBalanceNotZero = 5115,
    BankReservedUsernameConflict = 5116,
    BankRegisterUsernameReuse = 5117,
    BankRegisterPaytoUriReuse = 5118,
    BankWithdrawalOperationAborted = 5119,
    BankConfirmIncomplete = 5121,
    BankConfirmAbortConflict = 5122,
    BankAbortConfirmConflict = 5123,
    BankMissingTanInfo = 5124,
    BankTanChannelScriptFailed = 5125,
    BankTransferRequestUidReused = 5126,
    BankNonAdminPatchLegalName = 5127,
    BankNonAdminPatchDebtLimit = 5128,
    BankNonAdminPatchCashout = 5129,
    BankTanChannelNotSupported = 5130,
    BankTanChallengeFailed = 5131,
    BankTanChallengeExpired = 5132,
    BankTanRateLimited = 5133,
    BankNonAdminSetTanChannel = 5134,
    BankPatchAdminExchange = 5135,
    BankBadConversion = 5136,
    BankConversionAmountToSmall = 5137,
    BankAmountDiffers = 5138,
    BankUnknownCreditor = 5139,
    BankUnknownDebtor = 5140,
    BankAdminCreditor = 5141,
    BankConversionNotSupported = 5142,
    BankSoftException = 5143,
    BankUnmanagedException = 5144,
    BankRequestUidReuse = 5146,
}

impl TalerErrorCode {
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Registry symbol, used as the default hint.
    pub fn name(self) -> &'static str {
        use TalerErrorCode::*;
        match self {
            EndpointUnknown => "GENERIC_ENDPOINT_UNKNOWN",
            GenericJsonInvalid => "GENERIC_JSON_INVALID",
            GenericPaytoUriMalformed => "GENERIC_PAYTO_URI_MALFORMED",
            GenericParameterMissing => "GENERIC_PARAMETER_MISSING",
            GenericMethodInvalid => "GENERIC_METHOD_INVALID",
            GenericParameterMalformed => "GENERIC_PARAMETER_MALFORMED",
            GenericCurrencyMismatch => "GENERIC_CURRENCY_MISMATCH",
            GenericUnauthorized => "GENERIC_UNAUTHORIZED",
            GenericTokenUnknown => "GENERIC_TOKEN_UNKNOWN",
            GenericTokenExpired => "GENERIC_TOKEN_EXPIRED",
            GenericTokenPermissionInsufficient => "GENERIC_TOKEN_PERMISSION_INSUFFICIENT",
            GenericUploadExceedsLimit => "GENERIC_UPLOAD_EXCEEDS_LIMIT",
            GenericInternalInvariantFailure => "GENERIC_INTERNAL_INVARIANT_FAILURE",
            BankSameAccount => "BANK_SAME_ACCOUNT",
            BankUnallowedDebit => "BANK_UNALLOWED_DEBIT",
            BankNegativeNumberAmount => "BANK_NEGATIVE_NUMBER_AMOUNT",
            BankNumberTooBig => "BANK_NUMBER_TOO_BIG",
            BankTransactionNotFound => "BANK_TRANSACTION_NOT_FOUND",
            BankLoginFailed => "BANK_LOGIN_FAILED",
            BankUnknownAccount => "BANK_UNKNOWN_ACCOUNT",
            BankAccountIsExchange => "BANK_ACCOUNT_IS_EXCHANGE",
            BankAccountIsNotExchange => "BANK_ACCOUNT_IS_NOT_EXCHANGE",
            BankBadFormatAmount => "BANK_BAD_FORMAT_AMOUNT",
            BankReserveSelectionConflict => {
                "BANK_WITHDRAWAL_OPERATION_RESERVE_SELECTION_CONFLICT"
            }
            BankDuplicateReservePubSubject => "BANK_DUPLICATE_RESERVE_PUB_SUBJECT",
            BankAccountBalanceNotZero => "BANK_ACCOUNT_BALANCE_NOT_ZERO",
            BankReservedUsernameConflict => "BANK_RESERVED_USERNAME_CONFLICT",
            BankRegisterUsernameReuse => "BANK_REGISTER_USERNAME_REUSE",
            BankRegisterPaytoUriReuse => "BANK_REGISTER_PAYTO_URI_REUSE",
            BankWithdrawalOperationAborted => "BANK_WITHDRAWAL_OPERATION_ABORTED",
            BankConfirmIncomplete => "BANK_CONFIRM_INCOMPLETE",
            BankConfirmAbortConflict => "BANK_CONFIRM_ABORT_CONFLICT",
            BankAbortConfirmConflict => "BANK_ABORT_CONFIRM_CONFLICT",
            BankMissingTanInfo => "BANK_MISSING_TAN_INFO",
            BankTanChannelScriptFailed => "BANK_TAN_CHANNEL_SCRIPT_FAILED",
            BankTransferRequestUidReused => "BANK_TRANSFER_REQUEST_UID_REUSED",
            BankNonAdminPatchLegalName => "BANK_NON_ADMIN_PATCH_LEGAL_NAME",
            BankNonAdminPatchDebtLimit => "BANK_NON_ADMIN_PATCH_DEBT_LIMIT",
            BankNonAdminPatchCashout => "BANK_NON_ADMIN_PATCH_CASHOUT",
            BankTanChannelNotSupported => "BANK_TAN_CHANNEL_NOT_SUPPORTED",
            BankTanChallengeFailed => "BANK_TAN_CHALLENGE_FAILED",
            BankTanChallengeExpired => "BANK_TAN_CHALLENGE_EXPIRED",
            BankTanRateLimited => "BANK_TAN_RATE_LIMITED",
            BankNonAdminSetTanChannel => "BANK_NON_ADMIN_SET_TAN_CHANNEL",
            BankPatchAdminExchange => "BANK_PATCH_ADMIN_EXCHANGE",
            BankBadConversion => "BANK_BAD_CONVERSION",
            BankConversionAmountToSmall => "BANK_CONVERSION_AMOUNT_TO_SMALL",
            BankAmountDiffers => "BANK_AMOUNT_DIFFERS",
            BankUnknownCreditor => "BANK_UNKNOWN_CREDITOR",
            BankUnknownDebtor => "BANK_UNKNOWN_DEBTOR",
            BankAdminCreditor => "BANK_ADMIN_CREDITOR",
            BankConversionNotSupported => "BANK_CONVERSION_NOT_SUPPORTED",
            BankSoftException => "BANK_SOFT_EXCEPTION",
            BankUnmanagedException => "BANK_UNMANAGED_EXCEPTION",
            BankRequestUidReuse => "BANK_REQUEST_UID_REUSE",
        }
    }
}

impl fmt::Display for TalerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for TalerErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_as_numbers() {
        let json = serde_json::to_string(&TalerErrorCode::BankUnallowedDebit).unwrap();
        assert_eq!(json, "5102");
    }

    #[test]
    fn names_match_registry_symbols() {
        assert_eq!(TalerErrorCode::BankTanRateLimited.name(), "BANK_TAN_RATE_LIMITED");
        assert_eq!(
            TalerErrorCode::BankConfirmAbortConflict.name(),
            "BANK_CONFIRM_ABORT_CONFLICT"
        );
    }
}
