//! In-memory repositories
//!
//! Entities are held as `Arc` snapshots in a concurrent map. Readers clone
//! the `Arc` and never observe a half-applied write; writers to the same
//! name are serialized by the map's entry lock while different names
//! proceed independently.

use crate::models::{ConfigurationSet, EventDestination, Identity, Template, TemplateContent};
use crate::repository::{ConfigurationSetRepository, IdentityRepository, TemplateRepository};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use outpost_common::types::{IdentityKind, VerificationStatus};
use outpost_common::{EntityKind, Error, Result};
use std::sync::Arc;

/// Apply `f` to a copy of the stored value and swap the copy in
fn modify<T, F>(map: &DashMap<String, Arc<T>>, key: &str, missing: Error, f: F) -> Result<T>
where
    T: Clone,
    F: FnOnce(&mut T) -> Result<()>,
{
    let mut slot = map.get_mut(key).ok_or(missing)?;
    let mut updated = T::clone(&slot);
    f(&mut updated)?;
    *slot = Arc::new(updated.clone());
    Ok(updated)
}

fn sorted_by_key<T: Clone, K: Ord>(map: &DashMap<String, Arc<T>>, key: impl Fn(&T) -> K) -> Vec<T> {
    let mut items: Vec<T> = map.iter().map(|e| T::clone(e.value())).collect();
    items.sort_by_key(|item| key(item));
    items
}

/// In-memory identity repository
#[derive(Default)]
pub struct MemoryIdentityRepository {
    identities: DashMap<String, Arc<Identity>>,
}

impl MemoryIdentityRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityRepository for MemoryIdentityRepository {
    async fn create(&self, identity: Identity) -> Result<Identity> {
        match self.identities.entry(identity.value.clone()) {
            Entry::Occupied(_) => Err(Error::already_exists(EntityKind::Identity, &identity.value)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(identity.clone()));
                Ok(identity)
            }
        }
    }

    async fn get(&self, value: &str) -> Result<Option<Identity>> {
        Ok(self
            .identities
            .get(&value.to_lowercase())
            .map(|e| Identity::clone(e.value())))
    }

    async fn list(&self, kind: Option<IdentityKind>) -> Result<Vec<Identity>> {
        let mut items = sorted_by_key(&self.identities, |i| i.value.clone());
        if let Some(kind) = kind {
            items.retain(|i| i.kind == kind);
        }
        Ok(items)
    }

    async fn list_by_status(&self, status: VerificationStatus) -> Result<Vec<Identity>> {
        let mut items = sorted_by_key(&self.identities, |i| i.created_at);
        items.retain(|i| i.status == status);
        Ok(items)
    }

    async fn set_status(&self, value: &str, status: VerificationStatus) -> Result<Identity> {
        let key = value.to_lowercase();
        modify(
            &self.identities,
            &key,
            Error::does_not_exist(EntityKind::Identity, value),
            |identity| {
                identity.status = status;
                identity.updated_at = Utc::now();
                Ok(())
            },
        )
    }

    async fn set_dkim_tokens(&self, value: &str, tokens: Vec<String>) -> Result<Identity> {
        let key = value.to_lowercase();
        modify(
            &self.identities,
            &key,
            Error::does_not_exist(EntityKind::Identity, value),
            |identity| {
                identity.dkim_tokens = tokens;
                identity.updated_at = Utc::now();
                Ok(())
            },
        )
    }

    async fn set_dkim_enabled(&self, value: &str, enabled: bool) -> Result<Identity> {
        let key = value.to_lowercase();
        modify(
            &self.identities,
            &key,
            Error::does_not_exist(EntityKind::Identity, value),
            |identity| {
                identity.dkim_enabled = enabled;
                identity.updated_at = Utc::now();
                Ok(())
            },
        )
    }

    async fn delete(&self, value: &str) -> Result<Identity> {
        self.identities
            .remove(&value.to_lowercase())
            .map(|(_, identity)| Identity::clone(&identity))
            .ok_or_else(|| Error::does_not_exist(EntityKind::Identity, value))
    }
}

/// In-memory configuration set repository
#[derive(Default)]
pub struct MemoryConfigurationSetRepository {
    sets: DashMap<String, Arc<ConfigurationSet>>,
}

impl MemoryConfigurationSetRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn missing(name: &str) -> Error {
        Error::does_not_exist(EntityKind::ConfigurationSet, name)
    }
}

#[async_trait]
impl ConfigurationSetRepository for MemoryConfigurationSetRepository {
    async fn create(&self, set: ConfigurationSet) -> Result<ConfigurationSet> {
        match self.sets.entry(set.name.clone()) {
            Entry::Occupied(_) => Err(Error::already_exists(EntityKind::ConfigurationSet, &set.name)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(set.clone()));
                Ok(set)
            }
        }
    }

    async fn get(&self, name: &str) -> Result<Option<ConfigurationSet>> {
        Ok(self.sets.get(name).map(|e| ConfigurationSet::clone(e.value())))
    }

    async fn list(&self) -> Result<Vec<ConfigurationSet>> {
        Ok(sorted_by_key(&self.sets, |s| s.name.clone()))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.sets
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::missing(name))
    }

    async fn set_sending_enabled(&self, name: &str, enabled: bool) -> Result<ConfigurationSet> {
        modify(&self.sets, name, Self::missing(name), |set| {
            set.sending_enabled = enabled;
            set.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn set_tracking_domain(
        &self,
        name: &str,
        domain: Option<String>,
    ) -> Result<ConfigurationSet> {
        modify(&self.sets, name, Self::missing(name), |set| {
            set.tracking_domain = domain;
            set.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn add_event_destination(
        &self,
        name: &str,
        destination: EventDestination,
    ) -> Result<ConfigurationSet> {
        modify(&self.sets, name, Self::missing(name), |set| {
            if set
                .event_destinations
                .iter()
                .any(|d| d.name == destination.name)
            {
                return Err(Error::already_exists(
                    EntityKind::EventDestination,
                    &destination.name,
                ));
            }
            set.event_destinations.push(destination);
            set.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn remove_event_destination(
        &self,
        name: &str,
        destination: &str,
    ) -> Result<ConfigurationSet> {
        modify(&self.sets, name, Self::missing(name), |set| {
            let before = set.event_destinations.len();
            set.event_destinations.retain(|d| d.name != destination);
            if set.event_destinations.len() == before {
                return Err(Error::does_not_exist(
                    EntityKind::EventDestination,
                    destination,
                ));
            }
            set.updated_at = Utc::now();
            Ok(())
        })
    }
}

/// In-memory template repository
#[derive(Default)]
pub struct MemoryTemplateRepository {
    templates: DashMap<String, Arc<Template>>,
}

impl MemoryTemplateRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TemplateRepository for MemoryTemplateRepository {
    async fn create(&self, content: TemplateContent) -> Result<Template> {
        match self.templates.entry(content.name.clone()) {
            Entry::Occupied(_) => Err(Error::already_exists(EntityKind::Template, &content.name)),
            Entry::Vacant(slot) => {
                let template = content.into_template();
                slot.insert(Arc::new(template.clone()));
                Ok(template)
            }
        }
    }

    async fn get(&self, name: &str) -> Result<Option<Template>> {
        Ok(self.templates.get(name).map(|e| Template::clone(e.value())))
    }

    async fn update(&self, content: TemplateContent) -> Result<Template> {
        let name = content.name.clone();
        modify(
            &self.templates,
            &name,
            Error::does_not_exist(EntityKind::Template, &name),
            |template| {
                template.subject_part = content.subject_part;
                template.html_part = content.html_part;
                template.text_part = content.text_part;
                template.updated_at = Utc::now();
                Ok(())
            },
        )
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.templates
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::does_not_exist(EntityKind::Template, name))
    }

    async fn list(&self) -> Result<Vec<Template>> {
        Ok(sorted_by_key(&self.templates, |t| t.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_common::types::EventKind;
    use pretty_assertions::assert_eq;

    fn content(name: &str, subject: &str) -> TemplateContent {
        TemplateContent {
            name: name.to_string(),
            subject_part: subject.to_string(),
            html_part: Some("<p>{{name}}</p>".to_string()),
            text_part: None,
        }
    }

    #[tokio::test]
    async fn test_identity_create_duplicate() {
        let repo = MemoryIdentityRepository::new();
        let identity = Identity::pending("example.com", IdentityKind::Domain, None);
        repo.create(identity.clone()).await.unwrap();

        let err = repo.create(identity).await.unwrap_err();
        assert_eq!(err.code(), "IdentityAlreadyExists");
    }

    #[tokio::test]
    async fn test_identity_lookup_is_case_insensitive() {
        let repo = MemoryIdentityRepository::new();
        repo.create(Identity::pending("User@Example.com", IdentityKind::EmailAddress, None))
            .await
            .unwrap();

        let found = repo.get("USER@example.COM").await.unwrap().unwrap();
        assert_eq!(found.value, "user@example.com");

        let updated = repo
            .set_status("user@EXAMPLE.com", VerificationStatus::Success)
            .await
            .unwrap();
        assert!(updated.is_verified());
    }

    #[tokio::test]
    async fn test_identity_delete_missing() {
        let repo = MemoryIdentityRepository::new();
        let err = repo.delete("nobody@example.com").await.unwrap_err();
        assert_eq!(err.code(), "IdentityDoesNotExist");
    }

    #[tokio::test]
    async fn test_template_update_replaces_all_parts() {
        let repo = MemoryTemplateRepository::new();
        repo.create(content("welcome", "Hi")).await.unwrap();

        let updated = repo
            .update(TemplateContent {
                name: "welcome".to_string(),
                subject_part: "Hello".to_string(),
                html_part: None,
                text_part: Some("plain".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(updated.subject_part, "Hello");
        assert_eq!(updated.html_part, None);
        assert_eq!(updated.text_part.as_deref(), Some("plain"));
    }

    #[tokio::test]
    async fn test_template_update_missing() {
        let repo = MemoryTemplateRepository::new();
        let err = repo.update(content("nope", "Hi")).await.unwrap_err();
        assert_eq!(err.code(), "TemplateDoesNotExist");
    }

    #[tokio::test]
    async fn test_concurrent_template_updates_do_not_interleave() {
        let repo = Arc::new(MemoryTemplateRepository::new());
        repo.create(content("t", "initial")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..32 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.update(TemplateContent {
                    name: "t".to_string(),
                    subject_part: format!("subject-{}", i),
                    html_part: Some(format!("html-{}", i)),
                    text_part: Some(format!("text-{}", i)),
                })
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let template = repo.get("t").await.unwrap().unwrap();
        let n = template.subject_part.trim_start_matches("subject-");
        assert_eq!(template.html_part, Some(format!("html-{}", n)));
        assert_eq!(template.text_part, Some(format!("text-{}", n)));
    }

    #[tokio::test]
    async fn test_event_destination_add_remove() {
        let repo = MemoryConfigurationSetRepository::new();
        repo.create(ConfigurationSet::new("tx")).await.unwrap();

        let dest = EventDestination::new("bounces", vec![EventKind::Bounce]).with_sns("topic");
        let set = repo.add_event_destination("tx", dest.clone()).await.unwrap();
        assert_eq!(set.event_destinations.len(), 1);

        let err = repo.add_event_destination("tx", dest).await.unwrap_err();
        assert_eq!(err.code(), "EventDestinationAlreadyExists");

        let set = repo.remove_event_destination("tx", "bounces").await.unwrap();
        assert!(set.event_destinations.is_empty());

        let err = repo.remove_event_destination("tx", "bounces").await.unwrap_err();
        assert_eq!(err.code(), "EventDestinationDoesNotExist");
    }
}
