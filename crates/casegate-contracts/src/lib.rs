use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CONTRACT_VERSION: u32 = 1;

pub const REVIEW_REQUEST_SCHEMA: &str =
    include_str!("../../../contracts/v1/review-request.schema.json");
pub const GATE_DECISION_SCHEMA: &str =
    include_str!("../../../contracts/v1/gate-decision.schema.json");
pub const RECORD_FIXTURES_SCHEMA: &str =
    include_str!("../../../contracts/v1/record-fixtures.schema.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Account,
    Contact,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityRef {
    pub id: Uuid,
    pub kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl EntityRef {
    pub fn account(id: Uuid) -> Self {
        Self {
            id,
            kind: EntityKind::Account,
            name: None,
        }
    }

    pub fn contact(id: Uuid) -> Self {
        Self {
            id,
            kind: EntityKind::Contact,
            name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Active,
    Resolved,
    Cancelled,
}

impl CaseStatus {
    pub fn is_active(self) -> bool {
        matches!(self, CaseStatus::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaseRecord {
    pub id: Uuid,
    #[serde(default)]
    pub contact: Option<EntityRef>,
    #[serde(default)]
    pub customer: Option<EntityRef>,
    pub title: String,
    pub status: CaseStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaseChange {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "nullable_lookup"
    )]
    pub contact: Option<Option<EntityRef>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "nullable_lookup"
    )]
    pub customer: Option<Option<EntityRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CaseStatus>,
}

fn nullable_lookup<'de, D>(deserializer: D) -> Result<Option<Option<EntityRef>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<EntityRef>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContactRecord {
    pub id: Uuid,
    #[serde(default)]
    pub mobile_phone: Option<String>,
    #[serde(default)]
    pub do_not_phone: bool,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub do_not_email: bool,
    #[serde(default)]
    pub parent_account: Option<EntityRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountRecord {
    pub id: Uuid,
    #[serde(default)]
    pub primary_contact: Option<EntityRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordFixtures {
    #[serde(default)]
    pub contacts: Vec<ContactRecord>,
    #[serde(default)]
    pub accounts: Vec<AccountRecord>,
    #[serde(default)]
    pub cases: Vec<CaseRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    ContactConsistency,
    SingleActiveCase,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleViolation {
    pub rule: RuleId,
    pub reason_code: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOperation {
    Create,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReviewRequest {
    pub v: u32,
    pub operation: WriteOperation,
    pub case_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre: Option<CaseRecord>,
    #[serde(default)]
    pub change: CaseChange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewOutcome {
    Allow,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageResult {
    Passed,
    Rejected,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageOutcome {
    pub rule: RuleId,
    pub result: StageResult,
    pub reason_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateDecision {
    pub v: u32,
    pub case_id: Uuid,
    pub operation: WriteOperation,
    pub outcome: ReviewOutcome,
    pub snapshot_sha256: String,
    pub evaluated_at: String,
    pub stages: Vec<StageOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violation: Option<RuleViolation>,
}

impl GateDecision {
    pub fn allowed(&self) -> bool {
        self.outcome == ReviewOutcome::Allow
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractSchema {
    pub path: &'static str,
    pub sha256: String,
    pub body: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractsManifest {
    pub contract_version: u32,
    pub contracts_set_sha256: String,
    pub schemas: Vec<ContractSchema>,
}

pub fn contract_schemas() -> Vec<ContractSchema> {
    let sources = [
        ("contracts/v1/review-request.schema.json", REVIEW_REQUEST_SCHEMA),
        ("contracts/v1/gate-decision.schema.json", GATE_DECISION_SCHEMA),
        (
            "contracts/v1/record-fixtures.schema.json",
            RECORD_FIXTURES_SCHEMA,
        ),
    ];
    sources
        .into_iter()
        .map(|(path, body)| ContractSchema {
            path,
            sha256: sha256_hex(body.as_bytes()),
            body,
        })
        .collect()
}

pub fn contracts_manifest() -> ContractsManifest {
    let schemas = contract_schemas();
    let mut hasher = Sha256::new();
    for schema in &schemas {
        hasher.update(schema.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(schema.body.as_bytes());
        hasher.update([0u8]);
    }
    ContractsManifest {
        contract_version: CONTRACT_VERSION,
        contracts_set_sha256: format!("{:x}", hasher.finalize()),
        schemas,
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_accepts_unknown_logical_names() {
        let kind: EntityKind = serde_json::from_str("\"lead\"").unwrap();
        assert_eq!(kind, EntityKind::Other);
        let kind: EntityKind = serde_json::from_str("\"account\"").unwrap();
        assert_eq!(kind, EntityKind::Account);
    }

    #[test]
    fn case_change_distinguishes_absent_from_null() {
        let absent: CaseChange = serde_json::from_str(r#"{"title":"Billing"}"#).unwrap();
        assert_eq!(absent.contact, None);

        let cleared: CaseChange = serde_json::from_str(r#"{"contact":null}"#).unwrap();
        assert_eq!(cleared.contact, Some(None));

        let id = Uuid::new_v4();
        let set: CaseChange =
            serde_json::from_str(&format!(r#"{{"contact":{{"id":"{id}","kind":"contact"}}}}"#))
                .unwrap();
        assert_eq!(set.contact, Some(Some(EntityRef::contact(id))));
    }

    #[test]
    fn case_change_round_trips_explicit_null() {
        let change = CaseChange {
            customer: Some(None),
            ..CaseChange::default()
        };
        let text = serde_json::to_string(&change).unwrap();
        assert_eq!(text, r#"{"customer":null}"#);
        let back: CaseChange = serde_json::from_str(&text).unwrap();
        assert_eq!(back, change);
    }

    #[test]
    fn review_request_rejects_unknown_fields() {
        let id = Uuid::new_v4();
        let raw = format!(
            r#"{{"v":1,"operation":"create","case_id":"{id}","change":{{}},"extra":true}}"#
        );
        assert!(serde_json::from_str::<ReviewRequest>(&raw).is_err());
    }

    #[test]
    fn embedded_schemas_are_valid_json_schema() {
        for schema in contract_schemas() {
            let value: serde_json::Value = serde_json::from_str(schema.body)
                .unwrap_or_else(|err| panic!("{} is not json: {err}", schema.path));
            jsonschema::validator_for(&value)
                .unwrap_or_else(|err| panic!("{} is not a valid schema: {err}", schema.path));
        }
    }

    #[test]
    fn manifest_digest_is_stable() {
        let first = contracts_manifest();
        let second = contracts_manifest();
        assert_eq!(first.contracts_set_sha256, second.contracts_set_sha256);
        assert_eq!(first.contracts_set_sha256.len(), 64);
        assert_eq!(first.schemas.len(), 3);
        for schema in &first.schemas {
            assert_eq!(schema.sha256.len(), 64);
        }
    }
}
