//! Read-projection entities handed to the presentation layer.
//!
//! Every record here is derived and recomputable from the ledger and the
//! message backend; none of them is a system of record. Lists are value
//! snapshots, replaced wholesale on each fetch cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Label used when a dispute participant's profile cannot be resolved.
pub const UNKNOWN_LABEL: &str = "Unknown";

// =============================================================================
// Address
// =============================================================================

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("expected 40 hex characters, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// 20-byte ledger account address.
///
/// Parsing accepts any casing with or without the `0x` prefix; display is
/// always lower-case with the prefix, so equality is case-insensitive.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address([u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// `0x1234…abcd` style label: first six and last four characters.
    pub fn short_label(&self) -> String {
        let full = self.to_string();
        format!("{}…{}", &full[..6], &full[full.len() - 4..])
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if digits.len() != 40 {
            return Err(AddressError::InvalidLength(digits.len()));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(digits, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Identity
// =============================================================================

/// Wallet identity driving every identity-scoped pipeline stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub address: Option<Address>,
    pub is_connected: bool,
}

impl Identity {
    pub fn connected(address: Address) -> Self {
        Self {
            address: Some(address),
            is_connected: true,
        }
    }

    pub fn disconnected() -> Self {
        Self::default()
    }

    /// The address, only while connected.
    pub fn connected_address(&self) -> Option<Address> {
        if self.is_connected {
            self.address
        } else {
            None
        }
    }
}

// =============================================================================
// Jobs
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayType {
    Weekly,
    OneOff,
}

impl PayType {
    /// Ledger enum ordinal: 0 = weekly, 1 = one-off.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Weekly),
            1 => Some(Self::OneOff),
            _ => None,
        }
    }
}

/// Reputation registry average, already scaled down from the ledger's ×100.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rating {
    pub average: f64,
    pub total_ratings: u64,
}

impl Rating {
    pub fn from_scaled(average_x100: u64, total_ratings: u64) -> Self {
        Self {
            average: average_x100 as f64 / 100.0,
            total_ratings,
        }
    }
}

/// Public listing of a non-cancelled job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub address: Address,
    pub employer_address: Address,
    pub employer_display_name: String,
    pub title: String,
    pub description: String,
    pub pay_type: PayType,
    pub weekly_pay: u128,
    pub total_pay: u128,
    pub duration_weeks: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub positions: u64,
    pub positions_filled: u64,
    pub employer_rating: Rating,
}

/// A job owned by the connected employer, with its hiring state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmployerJob {
    #[serde(flatten)]
    pub summary: JobSummary,
    pub total_applications: u64,
    pub assigned_workers: Vec<Address>,
}

/// A job the connected address is assigned to as a worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    #[serde(flatten)]
    pub summary: JobSummary,
    pub assigned_workers: Vec<Address>,
    pub last_payout_at: Option<DateTime<Utc>>,
    pub payouts_made: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicantStatus {
    Pending,
    Reviewed,
}

/// One application, keyed by job + applicant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicantRecord {
    pub id: String,
    pub address: Address,
    pub job_address: Address,
    pub job_title: String,
    pub display_name: String,
    pub application_text: String,
    pub applied_at: Option<DateTime<Utc>>,
    pub status: ApplicantStatus,
    pub rating: Rating,
    pub tags: Vec<String>,
}

impl ApplicantRecord {
    pub fn record_id(job: &Address, applicant: &Address) -> String {
        format!("{job}{applicant}")
    }
}

// =============================================================================
// Disputes
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub address: Address,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisputeStatus {
    Pending,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    InFavorOfWorker,
    AgainstWorker,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Votes {
    #[serde(rename = "for")]
    pub votes_for: u64,
    pub against: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    Employer,
    Worker,
    Juror,
}

/// A message in a dispute thread with its derived role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub sender: Address,
    pub sender_display_name: String,
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeRecord {
    pub id: u64,
    pub job_address: Address,
    pub job_title: String,
    pub description: String,
    pub employer: Party,
    pub worker: Option<Party>,
    pub assigned_workers: Vec<Address>,
    pub initiator: Address,
    pub resolved: bool,
    pub status: DisputeStatus,
    pub resolution: Option<Resolution>,
    pub opened_date: Option<DateTime<Utc>>,
    pub voting_ends: Option<DateTime<Utc>>,
    pub votes: Votes,
    pub reason: String,
    pub messages: Vec<ChatMessage>,
}

impl DisputeRecord {
    /// Whether `address` opened the dispute or employs on the disputed job.
    pub fn involves(&self, address: &Address) -> bool {
        self.employer.address == *address || self.initiator == *address
    }
}

// =============================================================================
// Direct messages
// =============================================================================

/// A raw peer-to-peer message from the per-user feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub sender: Address,
    pub receiver: Address,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub counterparty_address: Address,
    pub counterparty_display_name: String,
    pub last_message: DirectMessage,
    pub messages: Vec<DirectMessage>,
}

// =============================================================================
// Profiles
// =============================================================================

/// Off-chain user directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileInfo {
    pub address: Address,
    pub display_name: String,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Convert a ledger unix-seconds value; zero means "never".
pub fn ledger_time(seconds: u64) -> Option<DateTime<Utc>> {
    if seconds == 0 {
        return None;
    }
    i64::try_from(seconds)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}
