use std::collections::BTreeMap;

use casegate_config::Form;
use casegate_contracts::{AccountRecord, ContactRecord, EntityRef};
use casegate_engine::{
    FieldRequirement, FormError, FormFields, FormSync, MemoryStore, SyncError,
};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
struct FieldState {
    value: Option<Vec<EntityRef>>,
    visible: bool,
    requirement: FieldRequirement,
    change_events: usize,
}

impl Default for FieldState {
    fn default() -> Self {
        Self {
            value: None,
            visible: true,
            requirement: FieldRequirement::None,
            change_events: 0,
        }
    }
}

#[derive(Debug, Default)]
struct TestForm {
    fields: BTreeMap<String, FieldState>,
    notices: Vec<String>,
}

impl TestForm {
    fn with_fields(names: &[&str]) -> Self {
        let mut form = Self::default();
        for name in names {
            form.fields.insert(name.to_string(), FieldState::default());
        }
        form
    }

    fn standard() -> Self {
        Self::with_fields(&["customerid", "primarycontactid", "emailaddress"])
    }

    fn put_value(&mut self, field: &str, value: Vec<EntityRef>) {
        self.fields.get_mut(field).unwrap().value = Some(value);
    }

    fn field(&self, name: &str) -> &FieldState {
        self.fields.get(name).unwrap()
    }
}

impl FormFields for TestForm {
    fn has_field(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    fn lookup_value(&self, field: &str) -> Result<Option<Vec<EntityRef>>, FormError> {
        self.fields
            .get(field)
            .map(|state| state.value.clone())
            .ok_or_else(|| FormError::MissingField(field.to_string()))
    }

    fn set_lookup(&mut self, field: &str, value: Option<Vec<EntityRef>>) -> Result<(), FormError> {
        let state = self
            .fields
            .get_mut(field)
            .ok_or_else(|| FormError::MissingField(field.to_string()))?;
        state.value = value;
        Ok(())
    }

    fn set_visible(&mut self, field: &str, visible: bool) -> Result<(), FormError> {
        let state = self
            .fields
            .get_mut(field)
            .ok_or_else(|| FormError::MissingField(field.to_string()))?;
        state.visible = visible;
        Ok(())
    }

    fn set_requirement(&mut self, field: &str, level: FieldRequirement) -> Result<(), FormError> {
        let state = self
            .fields
            .get_mut(field)
            .ok_or_else(|| FormError::MissingField(field.to_string()))?;
        state.requirement = level;
        Ok(())
    }

    fn notify_changed(&mut self, field: &str) -> Result<(), FormError> {
        let state = self
            .fields
            .get_mut(field)
            .ok_or_else(|| FormError::MissingField(field.to_string()))?;
        state.change_events += 1;
        Ok(())
    }

    fn show_error(&mut self, message: &str) {
        self.notices.push(message.to_string());
    }
}

fn form_cfg() -> Form {
    Form {
        customer_field: "customerid".to_string(),
        contact_field: "primarycontactid".to_string(),
        email_field: "emailaddress".to_string(),
    }
}

fn reachable_contact(id: Uuid, account: Uuid) -> ContactRecord {
    ContactRecord {
        id,
        mobile_phone: Some("+1 555 0100".to_string()),
        do_not_phone: false,
        email: Some("avery@example.test".to_string()),
        do_not_email: false,
        parent_account: Some(EntityRef::account(account)),
    }
}

#[tokio::test]
async fn account_customer_pulls_primary_contact() {
    let account_id = Uuid::new_v4();
    let contact_id = Uuid::new_v4();
    let primary = EntityRef::contact(contact_id).named("Avery Quinn");
    let mut store = MemoryStore::new();
    store.insert_account(AccountRecord {
        id: account_id,
        primary_contact: Some(primary.clone()),
    });
    store.insert_contact(reachable_contact(contact_id, account_id));

    let cfg = form_cfg();
    let sync = FormSync::new(&cfg, &store);
    let mut form = TestForm::standard();
    form.put_value("customerid", vec![EntityRef::account(account_id).named("Northwind")]);

    sync.apply_customer_change(&mut form).await.unwrap();

    let contact_field = form.field("primarycontactid");
    assert_eq!(contact_field.value, Some(vec![primary]));
    assert_eq!(contact_field.change_events, 1);
    assert!(contact_field.visible);
    assert_eq!(contact_field.requirement, FieldRequirement::Required);

    let email_field = form.field("emailaddress");
    assert!(!email_field.visible);
    assert_eq!(email_field.requirement, FieldRequirement::None);
}

#[tokio::test]
async fn account_without_primary_clears_contact() {
    let account_id = Uuid::new_v4();
    let mut store = MemoryStore::new();
    store.insert_account(AccountRecord {
        id: account_id,
        primary_contact: None,
    });

    let cfg = form_cfg();
    let sync = FormSync::new(&cfg, &store);
    let mut form = TestForm::standard();
    form.put_value("customerid", vec![EntityRef::account(account_id)]);
    form.put_value("primarycontactid", vec![EntityRef::contact(Uuid::new_v4())]);

    sync.apply_customer_change(&mut form).await.unwrap();

    let contact_field = form.field("primarycontactid");
    assert_eq!(contact_field.value, None);
    assert_eq!(contact_field.change_events, 1);
    assert_eq!(contact_field.requirement, FieldRequirement::Required);

    let email_field = form.field("emailaddress");
    assert!(email_field.visible);
    assert_eq!(email_field.requirement, FieldRequirement::Required);
}

#[tokio::test]
async fn contact_customer_passes_through_and_hides_field() {
    let contact_id = Uuid::new_v4();
    let mut store = MemoryStore::new();
    store.insert_contact(ContactRecord {
        id: contact_id,
        mobile_phone: None,
        do_not_phone: false,
        email: Some("dana@example.test".to_string()),
        do_not_email: true,
        parent_account: None,
    });

    let cfg = form_cfg();
    let sync = FormSync::new(&cfg, &store);
    let mut form = TestForm::standard();
    let customer = EntityRef::contact(contact_id).named("Dana Smith");
    form.put_value("customerid", vec![customer.clone()]);

    sync.apply_customer_change(&mut form).await.unwrap();

    let contact_field = form.field("primarycontactid");
    assert_eq!(contact_field.value, Some(vec![customer]));
    assert!(!contact_field.visible);
    assert_eq!(contact_field.requirement, FieldRequirement::None);

    let email_field = form.field("emailaddress");
    assert!(email_field.visible);
    assert_eq!(email_field.requirement, FieldRequirement::Required);
}

#[tokio::test]
async fn clearing_customer_clears_contact() {
    let store = MemoryStore::new();
    let cfg = form_cfg();
    let sync = FormSync::new(&cfg, &store);
    let mut form = TestForm::standard();
    form.put_value("primarycontactid", vec![EntityRef::contact(Uuid::new_v4())]);

    sync.apply_customer_change(&mut form).await.unwrap();

    let contact_field = form.field("primarycontactid");
    assert_eq!(contact_field.value, None);
    assert_eq!(contact_field.change_events, 1);
    assert!(contact_field.visible);
    assert_eq!(contact_field.requirement, FieldRequirement::None);

    let email_field = form.field("emailaddress");
    assert!(email_field.visible);
    assert_eq!(email_field.requirement, FieldRequirement::Required);
}

#[tokio::test]
async fn opted_out_contact_requires_email_capture() {
    let account_id = Uuid::new_v4();
    let contact_id = Uuid::new_v4();
    let mut store = MemoryStore::new();
    store.insert_account(AccountRecord {
        id: account_id,
        primary_contact: Some(EntityRef::contact(contact_id)),
    });
    store.insert_contact(ContactRecord {
        id: contact_id,
        mobile_phone: Some("   ".to_string()),
        do_not_phone: false,
        email: Some("kai@example.test".to_string()),
        do_not_email: true,
        parent_account: Some(EntityRef::account(account_id)),
    });

    let cfg = form_cfg();
    let sync = FormSync::new(&cfg, &store);
    let mut form = TestForm::standard();
    form.put_value("customerid", vec![EntityRef::account(account_id)]);

    sync.apply_customer_change(&mut form).await.unwrap();

    let email_field = form.field("emailaddress");
    assert!(email_field.visible);
    assert_eq!(email_field.requirement, FieldRequirement::Required);
}

#[tokio::test]
async fn contact_change_refreshes_email_policy() {
    let contact_id = Uuid::new_v4();
    let account_id = Uuid::new_v4();
    let mut store = MemoryStore::new();
    store.insert_contact(reachable_contact(contact_id, account_id));

    let cfg = form_cfg();
    let sync = FormSync::new(&cfg, &store);
    let mut form = TestForm::standard();
    form.put_value("primarycontactid", vec![EntityRef::contact(contact_id)]);

    sync.apply_contact_change(&mut form).await.unwrap();

    let email_field = form.field("emailaddress");
    assert!(!email_field.visible);
    assert_eq!(email_field.requirement, FieldRequirement::None);

    form.put_value("primarycontactid", vec![]);
    sync.apply_contact_change(&mut form).await.unwrap();
    let email_field = form.field("emailaddress");
    assert!(email_field.visible);
    assert_eq!(email_field.requirement, FieldRequirement::Required);
}

#[tokio::test]
async fn missing_binding_is_a_configuration_error() {
    let store = MemoryStore::new();
    let cfg = form_cfg();
    let sync = FormSync::new(&cfg, &store);
    let mut form = TestForm::with_fields(&["customerid", "primarycontactid"]);
    form.put_value("customerid", vec![EntityRef::account(Uuid::new_v4())]);

    let err = sync.apply_customer_change(&mut form).await.unwrap_err();
    match err {
        SyncError::Configuration(detail) => assert!(detail.contains("emailaddress")),
        other => panic!("expected configuration error, got {other:?}"),
    }
    assert_eq!(form.field("primarycontactid").change_events, 0);
}

#[tokio::test]
async fn event_entrypoint_reports_instead_of_failing() {
    let account_id = Uuid::new_v4();
    let contact_id = Uuid::new_v4();
    let mut store = MemoryStore::new();
    store.insert_account(AccountRecord {
        id: account_id,
        primary_contact: Some(EntityRef::contact(contact_id)),
    });

    let cfg = form_cfg();
    let sync = FormSync::new(&cfg, &store);
    let mut form = TestForm::standard();
    form.put_value("customerid", vec![EntityRef::account(account_id)]);

    sync.on_customer_change(&mut form).await;

    assert_eq!(form.notices.len(), 1);
    assert!(form.notices[0].contains("could not be refreshed"));
}

#[tokio::test]
async fn reapplying_the_same_customer_is_idempotent() {
    let account_id = Uuid::new_v4();
    let contact_id = Uuid::new_v4();
    let primary = EntityRef::contact(contact_id).named("Avery Quinn");
    let mut store = MemoryStore::new();
    store.insert_account(AccountRecord {
        id: account_id,
        primary_contact: Some(primary.clone()),
    });
    store.insert_contact(reachable_contact(contact_id, account_id));

    let cfg = form_cfg();
    let sync = FormSync::new(&cfg, &store);
    let mut form = TestForm::standard();
    form.put_value("customerid", vec![EntityRef::account(account_id)]);

    sync.apply_customer_change(&mut form).await.unwrap();
    let first = form.field("primarycontactid").clone();
    sync.apply_customer_change(&mut form).await.unwrap();
    let second = form.field("primarycontactid").clone();

    assert_eq!(first.value, second.value);
    assert_eq!(first.visible, second.visible);
    assert_eq!(first.requirement, second.requirement);
    assert_eq!(second.change_events, 2);
}
