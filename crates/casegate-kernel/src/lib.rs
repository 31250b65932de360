use casegate_contracts::{
    CaseChange, CaseRecord, CaseStatus, ContactRecord, EntityKind, EntityRef, RuleId,
    RuleViolation,
};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub fn parse_review_ts(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn overlay_case(case_id: Uuid, pre: Option<&CaseRecord>, change: &CaseChange) -> CaseRecord {
    let contact = match &change.contact {
        Some(patched) => patched.clone(),
        None => pre.and_then(|p| p.contact.clone()),
    };
    let customer = match &change.customer {
        Some(patched) => patched.clone(),
        None => pre.and_then(|p| p.customer.clone()),
    };
    let title = change
        .title
        .clone()
        .or_else(|| pre.map(|p| p.title.clone()))
        .unwrap_or_default();
    let status = change
        .status
        .or(pre.map(|p| p.status))
        .unwrap_or(CaseStatus::Active);
    CaseRecord {
        id: case_id,
        contact,
        customer,
        title,
        status,
    }
}

pub fn snapshot_sha256_hex(case: &CaseRecord) -> Result<String, String> {
    let value = serde_json::to_value(case)
        .map_err(|err| format!("failed to serialize case snapshot: {err}"))?;
    let canonical = serde_jcs::to_string(&value)
        .map_err(|err| format!("failed to canonicalize case snapshot: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyScope {
    NotApplicable,
    Check { contact: Uuid, customer: Uuid },
}

pub fn consistency_scope(case: &CaseRecord) -> ConsistencyScope {
    match (&case.contact, &case.customer) {
        (Some(contact), Some(customer)) if customer.kind == EntityKind::Account => {
            ConsistencyScope::Check {
                contact: contact.id,
                customer: customer.id,
            }
        }
        _ => ConsistencyScope::NotApplicable,
    }
}

pub fn consistency_verdict(
    customer: Uuid,
    parent_account: Option<&EntityRef>,
) -> Result<(), RuleViolation> {
    match parent_account {
        Some(parent) if parent.id == customer => Ok(()),
        _ => Err(RuleViolation {
            rule: RuleId::ContactConsistency,
            reason_code: "contact_not_associated".to_string(),
            message: "contact not associated with customer".to_string(),
        }),
    }
}

pub fn duplicate_active_verdict(existing: Option<&CaseRecord>) -> Result<(), RuleViolation> {
    match existing {
        Some(open) => Err(RuleViolation {
            rule: RuleId::SingleActiveCase,
            reason_code: "duplicate_active_case".to_string(),
            message: format!("customer already has an active case: {}", open.title),
        }),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionStep {
    Clear,
    PassThrough(EntityRef),
    FetchPrimaryContact(Uuid),
}

pub fn resolution_step(customer: Option<&EntityRef>) -> ResolutionStep {
    match customer {
        None => ResolutionStep::Clear,
        Some(reference) => match reference.kind {
            EntityKind::Contact => ResolutionStep::PassThrough(reference.clone()),
            EntityKind::Account => ResolutionStep::FetchPrimaryContact(reference.id),
            EntityKind::Other => ResolutionStep::Clear,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRequirement {
    None,
    Required,
}

pub fn contact_field_visible(customer_kind: Option<EntityKind>) -> bool {
    customer_kind != Some(EntityKind::Contact)
}

pub fn contact_field_requirement(customer_kind: Option<EntityKind>) -> FieldRequirement {
    if customer_kind == Some(EntityKind::Account) {
        FieldRequirement::Required
    } else {
        FieldRequirement::None
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelAvailability {
    pub mobile_phone: bool,
    pub email: bool,
}

impl ChannelAvailability {
    pub fn any(self) -> bool {
        self.mobile_phone || self.email
    }
}

pub fn channel_availability(contact: &ContactRecord) -> ChannelAvailability {
    ChannelAvailability {
        mobile_phone: usable_channel(contact.mobile_phone.as_deref(), contact.do_not_phone),
        email: usable_channel(contact.email.as_deref(), contact.do_not_email),
    }
}

fn usable_channel(value: Option<&str>, opted_out: bool) -> bool {
    !opted_out && value.map(|v| !v.trim().is_empty()).unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDirective {
    pub visible: bool,
    pub requirement: FieldRequirement,
}

pub fn email_field_policy(channels: ChannelAvailability) -> FieldDirective {
    if channels.any() {
        FieldDirective {
            visible: false,
            requirement: FieldRequirement::None,
        }
    } else {
        FieldDirective {
            visible: true,
            requirement: FieldRequirement::Required,
        }
    }
}
