use std::collections::BTreeMap;
use std::io::ErrorKind;

use async_trait::async_trait;
use casegate_config::Config;
use casegate_contracts::{
    AccountRecord, CaseRecord, ContactRecord, EntityRef, GateDecision, RecordFixtures,
    ReviewOutcome, ReviewRequest, RuleId, RuleViolation, StageOutcome, StageResult,
    WriteOperation, CONTRACT_VERSION,
};
use casegate_kernel::{
    channel_availability, consistency_scope, consistency_verdict, contact_field_requirement,
    contact_field_visible, duplicate_active_verdict, email_field_policy, overlay_case,
    parse_review_ts, resolution_step, snapshot_sha256_hex, ChannelAvailability, ConsistencyScope,
    ResolutionStep,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

pub use casegate_kernel::FieldRequirement;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("malformed record data: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn contact_parent_account(&self, id: Uuid) -> Result<Option<EntityRef>, StoreError>;
    async fn contact_record(&self, id: Uuid) -> Result<ContactRecord, StoreError>;
    async fn account_primary_contact(&self, id: Uuid) -> Result<Option<EntityRef>, StoreError>;
    async fn first_active_case(
        &self,
        customer: Uuid,
        exclude_case: Option<Uuid>,
    ) -> Result<Option<CaseRecord>, StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    contacts: BTreeMap<Uuid, ContactRecord>,
    accounts: BTreeMap<Uuid, AccountRecord>,
    cases: BTreeMap<Uuid, CaseRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixtures(fixtures: RecordFixtures) -> Self {
        let mut store = Self::new();
        for contact in fixtures.contacts {
            store.insert_contact(contact);
        }
        for account in fixtures.accounts {
            store.insert_account(account);
        }
        for case in fixtures.cases {
            store.insert_case(case);
        }
        store
    }

    pub fn insert_contact(&mut self, record: ContactRecord) {
        self.contacts.insert(record.id, record);
    }

    pub fn insert_account(&mut self, record: AccountRecord) {
        self.accounts.insert(record.id, record);
    }

    pub fn insert_case(&mut self, record: CaseRecord) {
        self.cases.insert(record.id, record);
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn contact_parent_account(&self, id: Uuid) -> Result<Option<EntityRef>, StoreError> {
        let contact = self
            .contacts
            .get(&id)
            .ok_or(StoreError::NotFound { entity: "contact", id })?;
        Ok(contact.parent_account.clone())
    }

    async fn contact_record(&self, id: Uuid) -> Result<ContactRecord, StoreError> {
        self.contacts
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { entity: "contact", id })
    }

    async fn account_primary_contact(&self, id: Uuid) -> Result<Option<EntityRef>, StoreError> {
        let account = self
            .accounts
            .get(&id)
            .ok_or(StoreError::NotFound { entity: "account", id })?;
        Ok(account.primary_contact.clone())
    }

    async fn first_active_case(
        &self,
        customer: Uuid,
        exclude_case: Option<Uuid>,
    ) -> Result<Option<CaseRecord>, StoreError> {
        Ok(self
            .cases
            .values()
            .find(|case| {
                case.status.is_active()
                    && case.customer.as_ref().map(|c| c.id) == Some(customer)
                    && Some(case.id) != exclude_case
            })
            .cloned())
    }
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("{}", .0.message)]
    Violation(RuleViolation),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub async fn check_contact_consistency(
    case: &CaseRecord,
    store: &dyn RecordStore,
) -> Result<(), RuleError> {
    let (contact, customer) = match consistency_scope(case) {
        ConsistencyScope::NotApplicable => return Ok(()),
        ConsistencyScope::Check { contact, customer } => (contact, customer),
    };
    let parent = store.contact_parent_account(contact).await?;
    consistency_verdict(customer, parent.as_ref()).map_err(RuleError::Violation)
}

pub async fn check_single_active_case(
    customer: &EntityRef,
    exclude_case: Option<Uuid>,
    store: &dyn RecordStore,
) -> Result<(), RuleError> {
    let existing = store.first_active_case(customer.id, exclude_case).await?;
    duplicate_active_verdict(existing.as_ref()).map_err(RuleError::Violation)
}

pub async fn resolve_contact(
    customer: Option<&EntityRef>,
    store: &dyn RecordStore,
) -> Result<Option<Vec<EntityRef>>, StoreError> {
    match resolution_step(customer) {
        ResolutionStep::Clear => Ok(None),
        ResolutionStep::PassThrough(reference) => Ok(Some(vec![reference])),
        ResolutionStep::FetchPrimaryContact(account) => Ok(store
            .account_primary_contact(account)
            .await?
            .map(|primary| vec![primary])),
    }
}

#[derive(Debug, Error)]
pub enum FormError {
    #[error("form field {0} is not present on the form")]
    MissingField(String),
    #[error("form backend failure: {0}")]
    Backend(String),
}

pub trait FormFields {
    fn has_field(&self, field: &str) -> bool;
    fn lookup_value(&self, field: &str) -> Result<Option<Vec<EntityRef>>, FormError>;
    fn set_lookup(&mut self, field: &str, value: Option<Vec<EntityRef>>) -> Result<(), FormError>;
    fn set_visible(&mut self, field: &str, visible: bool) -> Result<(), FormError>;
    fn set_requirement(&mut self, field: &str, level: FieldRequirement) -> Result<(), FormError>;
    fn notify_changed(&mut self, field: &str) -> Result<(), FormError>;
    fn show_error(&mut self, message: &str);
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("form layout misconfigured: {0}")]
    Configuration(String),
    #[error(transparent)]
    Form(#[from] FormError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct FormSync<'a, S> {
    form_cfg: &'a casegate_config::Form,
    store: &'a S,
}

impl<'a, S: RecordStore> FormSync<'a, S> {
    pub fn new(form_cfg: &'a casegate_config::Form, store: &'a S) -> Self {
        Self { form_cfg, store }
    }

    pub async fn on_customer_change(&self, form: &mut dyn FormFields) {
        if let Err(err) = self.apply_customer_change(form).await {
            form.show_error(&sync_error_notice(&err));
        }
    }

    pub async fn on_contact_change(&self, form: &mut dyn FormFields) {
        if let Err(err) = self.apply_contact_change(form).await {
            form.show_error(&sync_error_notice(&err));
        }
    }

    pub async fn apply_customer_change(&self, form: &mut dyn FormFields) -> Result<(), SyncError> {
        self.require_bindings(form)?;
        let customer = single_lookup(form.lookup_value(&self.form_cfg.customer_field)?);
        let resolved = resolve_contact(customer.as_ref(), self.store).await?;
        form.set_lookup(&self.form_cfg.contact_field, resolved)?;
        form.notify_changed(&self.form_cfg.contact_field)?;
        let kind = customer.as_ref().map(|c| c.kind);
        form.set_visible(&self.form_cfg.contact_field, contact_field_visible(kind))?;
        form.set_requirement(&self.form_cfg.contact_field, contact_field_requirement(kind))?;
        self.apply_email_policy(form).await
    }

    pub async fn apply_contact_change(&self, form: &mut dyn FormFields) -> Result<(), SyncError> {
        self.require_bindings(form)?;
        self.apply_email_policy(form).await
    }

    async fn apply_email_policy(&self, form: &mut dyn FormFields) -> Result<(), SyncError> {
        let contact = single_lookup(form.lookup_value(&self.form_cfg.contact_field)?);
        let channels = match contact {
            Some(reference) => {
                let record = self.store.contact_record(reference.id).await?;
                channel_availability(&record)
            }
            None => ChannelAvailability::default(),
        };
        let directive = email_field_policy(channels);
        form.set_visible(&self.form_cfg.email_field, directive.visible)?;
        form.set_requirement(&self.form_cfg.email_field, directive.requirement)?;
        Ok(())
    }

    fn require_bindings(&self, form: &dyn FormFields) -> Result<(), SyncError> {
        for field in [
            &self.form_cfg.customer_field,
            &self.form_cfg.contact_field,
            &self.form_cfg.email_field,
        ] {
            if !form.has_field(field) {
                return Err(SyncError::Configuration(format!(
                    "expected form field {field} is missing from the layout"
                )));
            }
        }
        Ok(())
    }
}

fn single_lookup(value: Option<Vec<EntityRef>>) -> Option<EntityRef> {
    value.and_then(|refs| refs.into_iter().next())
}

fn sync_error_notice(err: &SyncError) -> String {
    match err {
        SyncError::Configuration(detail) => format!("form configuration problem: {detail}"),
        other => format!("case form could not be refreshed: {other}"),
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("invalid review request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to hash case snapshot: {0}")]
    Snapshot(String),
}

pub struct WriteGate<S> {
    rules: casegate_config::Rules,
    include_stage_trace: bool,
    store: S,
    audit: AuditJsonl,
}

impl<S: RecordStore> WriteGate<S> {
    pub async fn new(cfg: &Config, store: S) -> Result<Self, String> {
        let audit = AuditJsonl::new(
            &cfg.audit.jsonl_path,
            cfg.audit.immutable_mirror_path.as_deref(),
        )
        .await?;
        Ok(Self {
            rules: cfg.rules.clone(),
            include_stage_trace: cfg.audit.include_stage_trace,
            store,
            audit,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn review(&self, request: &ReviewRequest) -> Result<GateDecision, GateError> {
        validate_review_request(request)?;
        let snapshot = overlay_case(request.case_id, request.pre.as_ref(), &request.change);
        let snapshot_sha256 = snapshot_sha256_hex(&snapshot).map_err(GateError::Snapshot)?;
        let evaluated_at = match &request.requested_at {
            Some(ts) => ts.clone(),
            None => Utc::now().to_rfc3339(),
        };

        let mut stages = Vec::with_capacity(2);
        let mut violation: Option<RuleViolation> = None;

        let stage = if !self.rules.contact_consistency.enabled {
            stage_skipped(RuleId::ContactConsistency, "rule_disabled")
        } else if consistency_scope(&snapshot) == ConsistencyScope::NotApplicable {
            stage_skipped(RuleId::ContactConsistency, "not_applicable")
        } else {
            match check_contact_consistency(&snapshot, &self.store).await {
                Ok(()) => stage_passed(RuleId::ContactConsistency, "contact_consistency_pass"),
                Err(RuleError::Violation(found)) => {
                    let stage = stage_rejected(&found);
                    violation = Some(found);
                    stage
                }
                Err(RuleError::Store(err)) => {
                    return Err(self.review_failed(request, &snapshot_sha256, err).await);
                }
            }
        };
        stages.push(stage);

        let stage = if violation.is_some() {
            stage_skipped(RuleId::SingleActiveCase, "short_circuit")
        } else if !self.rules.single_active_case.enabled {
            stage_skipped(RuleId::SingleActiveCase, "rule_disabled")
        } else if request.operation == WriteOperation::Update
            && !self.rules.single_active_case.enforce_on_update
        {
            stage_skipped(RuleId::SingleActiveCase, "update_not_enforced")
        } else {
            match &snapshot.customer {
                None => stage_skipped(RuleId::SingleActiveCase, "no_customer"),
                Some(customer) => {
                    let exclude = match request.operation {
                        WriteOperation::Create => None,
                        WriteOperation::Update => Some(snapshot.id),
                    };
                    match check_single_active_case(customer, exclude, &self.store).await {
                        Ok(()) => {
                            stage_passed(RuleId::SingleActiveCase, "single_active_case_pass")
                        }
                        Err(RuleError::Violation(found)) => {
                            let stage = stage_rejected(&found);
                            violation = Some(found);
                            stage
                        }
                        Err(RuleError::Store(err)) => {
                            return Err(self.review_failed(request, &snapshot_sha256, err).await);
                        }
                    }
                }
            }
        };
        stages.push(stage);

        let outcome = if violation.is_some() {
            ReviewOutcome::Reject
        } else {
            ReviewOutcome::Allow
        };
        let decision = GateDecision {
            v: CONTRACT_VERSION,
            case_id: request.case_id,
            operation: request.operation,
            outcome,
            snapshot_sha256,
            evaluated_at,
            stages,
            violation,
        };
        self.record_decision(&decision).await;
        Ok(decision)
    }

    // Audit is best effort: a failed append never flips an already-made decision.
    async fn record_decision(&self, decision: &GateDecision) {
        let result = match decision.outcome {
            ReviewOutcome::Allow => "allow",
            ReviewOutcome::Reject => "reject",
        };
        let reason = match &decision.violation {
            Some(found) => found.reason_code.as_str(),
            None => "write_allowed",
        };
        let mut record = AuditRecord::new(
            decision.case_id,
            decision.operation,
            result,
            reason,
            &decision.snapshot_sha256,
        );
        if self.include_stage_trace {
            record = record.with_trace(DecisionTrace::from_stages(&decision.stages));
        }
        let _ = self.audit.append(record).await;
    }

    async fn review_failed(
        &self,
        request: &ReviewRequest,
        snapshot_sha256: &str,
        err: StoreError,
    ) -> GateError {
        let record = AuditRecord::new(
            request.case_id,
            request.operation,
            "error",
            store_error_reason(&err),
            snapshot_sha256,
        );
        let _ = self.audit.append(record).await;
        GateError::Store(err)
    }
}

fn validate_review_request(request: &ReviewRequest) -> Result<(), GateError> {
    if request.v != CONTRACT_VERSION {
        return Err(GateError::Invalid(format!(
            "unsupported contract version {}",
            request.v
        )));
    }
    match (request.operation, &request.pre) {
        (WriteOperation::Create, Some(_)) => {
            return Err(GateError::Invalid(
                "pre image is not allowed on create".to_string(),
            ));
        }
        (WriteOperation::Update, None) => {
            return Err(GateError::Invalid(
                "pre image is required on update".to_string(),
            ));
        }
        (WriteOperation::Update, Some(pre)) if pre.id != request.case_id => {
            return Err(GateError::Invalid(
                "pre image id does not match case_id".to_string(),
            ));
        }
        _ => {}
    }
    if let Some(ts) = &request.requested_at {
        if parse_review_ts(ts).is_none() {
            return Err(GateError::Invalid(
                "requested_at must be an RFC 3339 timestamp".to_string(),
            ));
        }
    }
    Ok(())
}

fn stage_passed(rule: RuleId, reason_code: &str) -> StageOutcome {
    StageOutcome {
        rule,
        result: StageResult::Passed,
        reason_code: reason_code.to_string(),
    }
}

fn stage_skipped(rule: RuleId, reason_code: &str) -> StageOutcome {
    StageOutcome {
        rule,
        result: StageResult::Skipped,
        reason_code: reason_code.to_string(),
    }
}

fn stage_rejected(violation: &RuleViolation) -> StageOutcome {
    StageOutcome {
        rule: violation.rule,
        result: StageResult::Rejected,
        reason_code: violation.reason_code.clone(),
    }
}

fn store_error_reason(err: &StoreError) -> &'static str {
    match err {
        StoreError::NotFound { .. } => "store_not_found",
        StoreError::Unavailable(_) => "store_unavailable",
        StoreError::Malformed(_) => "store_malformed",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub audit_id: String,
    pub ts: String,
    pub case_id: Uuid,
    pub operation: WriteOperation,
    pub result: String,
    pub reason_code: String,
    pub snapshot_sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_trace: Option<DecisionTrace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    #[serde(default)]
    pub record_hash: String,
}

impl AuditRecord {
    pub fn new(
        case_id: Uuid,
        operation: WriteOperation,
        result: &str,
        reason_code: &str,
        snapshot_sha256: &str,
    ) -> Self {
        Self {
            audit_id: Uuid::new_v4().to_string(),
            ts: Utc::now().to_rfc3339(),
            case_id,
            operation,
            result: result.to_string(),
            reason_code: reason_code.to_string(),
            snapshot_sha256: snapshot_sha256.to_string(),
            decision_trace: None,
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    pub fn with_trace(mut self, trace: DecisionTrace) -> Self {
        self.decision_trace = Some(trace);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTrace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_consistency: Option<StageOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_active_case: Option<StageOutcome>,
}

impl DecisionTrace {
    pub fn from_stages(stages: &[StageOutcome]) -> Self {
        let mut trace = Self {
            contact_consistency: None,
            single_active_case: None,
        };
        for stage in stages {
            match stage.rule {
                RuleId::ContactConsistency => trace.contact_consistency = Some(stage.clone()),
                RuleId::SingleActiveCase => trace.single_active_case = Some(stage.clone()),
            }
        }
        trace
    }
}

pub struct AuditJsonl {
    file: Mutex<File>,
    mirror: Option<Mutex<File>>,
    last_hash: Mutex<Option<String>>,
}

impl AuditJsonl {
    pub async fn new(path: &str, mirror_path: Option<&str>) -> Result<Self, String> {
        let last_hash = read_last_hash(path).await?;
        let file = open_append(path).await?;
        let mirror = match mirror_path {
            Some(p) => Some(Mutex::new(open_append(p).await?)),
            None => None,
        };
        Ok(Self {
            file: Mutex::new(file),
            mirror,
            last_hash: Mutex::new(last_hash),
        })
    }

    pub async fn append(&self, mut record: AuditRecord) -> Result<String, String> {
        let mut last = self.last_hash.lock().await;
        record.prev_hash = last.clone();
        record.record_hash = String::new();
        let unhashed = serde_json::to_string(&record)
            .map_err(|err| format!("failed to serialize audit record: {err}"))?;
        record.record_hash = sha256_hex(unhashed.as_bytes());
        let mut line = serde_json::to_string(&record)
            .map_err(|err| format!("failed to serialize audit record: {err}"))?;
        line.push('\n');

        let mut file = self.file.lock().await;
        write_line(&mut file, &line).await?;
        if let Some(mirror) = &self.mirror {
            let mut mirror = mirror.lock().await;
            write_line(&mut mirror, &line).await?;
        }
        *last = Some(record.record_hash.clone());
        Ok(record.record_hash)
    }
}

async fn open_append(path: &str) -> Result<File, String> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|err| format!("failed to open audit log {path}: {err}"))
}

async fn write_line(file: &mut File, line: &str) -> Result<(), String> {
    file.write_all(line.as_bytes())
        .await
        .map_err(|err| format!("failed to append audit record: {err}"))?;
    file.flush()
        .await
        .map_err(|err| format!("failed to flush audit log: {err}"))
}

async fn read_last_hash(path: &str) -> Result<Option<String>, String> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read audit log {path}: {err}")),
    };
    for line in content.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: AuditRecord = serde_json::from_str(line)
            .map_err(|err| format!("existing audit log {path} is corrupt: {err}"))?;
        return Ok(Some(record.record_hash));
    }
    Ok(None)
}

pub fn verify_audit_chain(path: &str) -> Result<String, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read audit log {path}: {err}"))?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: AuditRecord = serde_json::from_str(line)
            .map_err(|err| format!("line {}: not a valid audit record: {err}", idx + 1))?;
        if count > 0 && record.prev_hash != prev {
            return Err(format!(
                "line {}: prev_hash does not match the preceding record",
                idx + 1
            ));
        }
        let mut unhashed = record.clone();
        unhashed.record_hash = String::new();
        let serialized = serde_json::to_string(&unhashed)
            .map_err(|err| format!("line {}: {err}", idx + 1))?;
        if sha256_hex(serialized.as_bytes()) != record.record_hash {
            return Err(format!("line {}: record_hash mismatch", idx + 1));
        }
        prev = Some(record.record_hash);
        count += 1;
    }
    Ok(format!("audit chain verified: {count} records"))
}

pub fn verify_audit_chain_with_mirror(path: &str, mirror_path: &str) -> Result<String, String> {
    let summary = verify_audit_chain(path)?;
    let primary = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read audit log {path}: {err}"))?;
    let mirror = std::fs::read_to_string(mirror_path)
        .map_err(|err| format!("failed to read audit mirror {mirror_path}: {err}"))?;
    if primary != mirror {
        return Err(format!(
            "immutable mirror {mirror_path} diverges from {path}"
        ));
    }
    Ok(format!("{summary}; mirror matches"))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
