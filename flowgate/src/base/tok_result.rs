use std::collections::HashMap;
use std::fmt;

use crate::error::Error;
use crate::error::Result;

/// Wire-stable outcome codes of the cluster token protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum TokResultStatus {
    BadRequest = -4,
    TooManyRequest = -2,
    Fail = -1,
    Ok = 0,
    Blocked = 1,
    ShouldWait = 2,
    NoRuleExists = 3,
    NoRefRuleExists = 4,
    NotAvailable = 5,
    ReleaseOk = 6,
    AlreadyRelease = 7,
}

impl TryFrom<i32> for TokResultStatus {
    type Error = i32;

    fn try_from(code: i32) -> std::result::Result<Self, i32> {
        Ok(match code {
            -4 => Self::BadRequest,
            -2 => Self::TooManyRequest,
            -1 => Self::Fail,
            0 => Self::Ok,
            1 => Self::Blocked,
            2 => Self::ShouldWait,
            3 => Self::NoRuleExists,
            4 => Self::NoRefRuleExists,
            5 => Self::NotAvailable,
            6 => Self::ReleaseOk,
            7 => Self::AlreadyRelease,
            other => return Err(other),
        })
    }
}

/// Answer of a token server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokResult {
    status: TokResultStatus,
    wait_ms: u64,
    token_id: i64,
    attachments: Option<HashMap<String, String>>,
}

impl TokResult {
    pub const OK: TokResult = TokResult::with_status(TokResultStatus::Ok);
    pub const BLOCKED: TokResult = TokResult::with_status(TokResultStatus::Blocked);
    pub const FAIL: TokResult = TokResult::with_status(TokResultStatus::Fail);
    pub const BAD_REQUEST: TokResult = TokResult::with_status(TokResultStatus::BadRequest);
    pub const TOO_MANY_REQUEST: TokResult = TokResult::with_status(TokResultStatus::TooManyRequest);
    pub const NO_RULE_EXISTS: TokResult = TokResult::with_status(TokResultStatus::NoRuleExists);

    pub const fn with_status(status: TokResultStatus) -> Self {
        Self {
            status,
            wait_ms: 0,
            token_id: 0,
            attachments: None,
        }
    }

    pub const fn should_wait(wait_ms: u64) -> Self {
        Self {
            status: TokResultStatus::ShouldWait,
            wait_ms,
            token_id: 0,
            attachments: None,
        }
    }

    pub fn with_token_id(mut self, token_id: i64) -> Self {
        self.token_id = token_id;
        self
    }

    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn status(&self) -> TokResultStatus {
        self.status
    }

    pub fn wait_ms(&self) -> u64 {
        self.wait_ms
    }

    pub fn token_id(&self) -> i64 {
        self.token_id
    }

    pub fn attachment(&self, key: &str) -> Option<&str> {
        self.attachments
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Encodes as `<status>|<waitMs>`.
    pub fn to_thin_string(&self) -> String {
        format!("{}|{}", self.status as i32, self.wait_ms)
    }

    /// Decodes `<status>|<waitMs>`. Extra trailing fields are ignored.
    pub fn from_thin_string(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidThinString(s.to_string());
        let mut parts = s.trim().split('|');
        let (Some(status), Some(wait)) = (parts.next(), parts.next()) else {
            return Err(invalid());
        };
        let status = status
            .trim()
            .parse::<i32>()
            .ok()
            .and_then(|code| TokResultStatus::try_from(code).ok())
            .ok_or_else(invalid)?;
        let wait_ms = wait.trim().parse::<u64>().map_err(|_| invalid())?;
        Ok(Self {
            status,
            wait_ms,
            token_id: 0,
            attachments: None,
        })
    }
}

impl fmt::Display for TokResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TokResult{{status={:?}, waitMs={}, tokenId={}}}",
            self.status, self.wait_ms, self.token_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TokResultStatus; 11] = [
        TokResultStatus::BadRequest,
        TokResultStatus::TooManyRequest,
        TokResultStatus::Fail,
        TokResultStatus::Ok,
        TokResultStatus::Blocked,
        TokResultStatus::ShouldWait,
        TokResultStatus::NoRuleExists,
        TokResultStatus::NoRefRuleExists,
        TokResultStatus::NotAvailable,
        TokResultStatus::ReleaseOk,
        TokResultStatus::AlreadyRelease,
    ];

    #[test]
    fn test_wire_codes_are_stable() {
        let codes: Vec<i32> = ALL.iter().map(|s| *s as i32).collect();
        assert_eq!(codes, [-4, -2, -1, 0, 1, 2, 3, 4, 5, 6, 7]);
        for status in ALL {
            assert_eq!(TokResultStatus::try_from(status as i32), Ok(status));
        }
        assert_eq!(TokResultStatus::try_from(-3), Err(-3));
    }

    #[test]
    fn test_thin_string_round_trip() {
        for status in ALL {
            for wait_ms in [0, 1, 20, 999, u64::from(u32::MAX)] {
                let tok = TokResult {
                    wait_ms,
                    ..TokResult::with_status(status)
                };
                let line = tok.to_thin_string();
                assert_eq!(TokResult::from_thin_string(&line).unwrap(), tok, "{line}");
            }
        }
    }

    #[test]
    fn test_thin_string_format() {
        assert_eq!(TokResult::OK.to_thin_string(), "0|0");
        assert_eq!(TokResult::should_wait(15).to_thin_string(), "2|15");
        assert_eq!(TokResult::BAD_REQUEST.to_thin_string(), "-4|0");
    }

    #[test]
    fn test_invalid_thin_strings() {
        for s in ["", "0", "a|0", "0|b", "9|0", "|"] {
            assert!(TokResult::from_thin_string(s).is_err(), "{s:?}");
        }
        assert_eq!(
            TokResult::from_thin_string(" 1|0\n").unwrap(),
            TokResult::BLOCKED
        );
    }

    #[test]
    fn test_attachments() {
        let tok = TokResult::OK.with_token_id(7).with_attachment("k", "v");
        assert_eq!(tok.token_id(), 7);
        assert_eq!(tok.attachment("k"), Some("v"));
        assert_eq!(TokResult::OK.attachment("k"), None);
    }
}
