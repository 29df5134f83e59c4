//! Repository for reusable split templates.

use std::sync::Arc;

use tracing::{debug, info};

use tabsplit_core::error::{Result, TabsplitError};
use tabsplit_core::events::StorageEvent;
use tabsplit_core::types::{
    new_record_id, normalize_tags, NewTemplate, RecordId, Template, TemplatePatch,
};

use crate::gateway::Gateway;
use crate::queries::{self, TemplateQuery};
use crate::schema::TEMPLATES;
use crate::tx::CursorSpec;

pub struct TemplateRepository {
    gateway: Arc<Gateway>,
}

impl TemplateRepository {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Store a new template. `lastUsed` starts out equal to `createdAt`.
    pub async fn create(&self, input: NewTemplate) -> Result<RecordId> {
        if input.name.trim().is_empty() {
            return Err(TabsplitError::InvalidData(
                "Template name must not be empty".to_string(),
            ));
        }
        let now = self.gateway.now();
        let template = Template {
            id: new_record_id(),
            name: input.name,
            description: input.description,
            participants: input.participants,
            default_split_method: input.default_split_method,
            default_settings: input.default_settings,
            tags: normalize_tags(&input.tags),
            usage_count: 0,
            last_used: now,
            created_at: now,
            updated_at: now,
        };

        let template = self
            .gateway
            .write(&[TEMPLATES], move |tx| {
                if !tx.add(&template)? {
                    return Err(TabsplitError::Storage(format!(
                        "Template id {} already exists",
                        template.id
                    )));
                }
                Ok(template)
            })
            .await?;

        info!(id = %template.id, name = %template.name, "Template created");
        self.gateway.emit(StorageEvent::TemplateCreated {
            id: template.id.clone(),
            name: template.name,
            timestamp: self.gateway.now(),
        });
        Ok(template.id)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Template>> {
        let id = id.to_string();
        self.gateway
            .read(&[TEMPLATES], move |tx| tx.get::<Template>(&id))
            .await
    }

    pub async fn update(&self, id: &str, patch: TemplatePatch) -> Result<Template> {
        if patch.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(TabsplitError::InvalidData(
                "Template name must not be empty".to_string(),
            ));
        }
        let now = self.gateway.now();
        let id = id.to_string();

        let template = self
            .modify(id, move |template| {
                template.apply(patch);
                template.updated_at = now.max(template.created_at);
            })
            .await?;
        debug!(id = %template.id, "Template updated");
        Ok(template)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        let target = id.clone();
        self.gateway
            .write(&[TEMPLATES], move |tx| {
                if tx.delete::<Template>(&target)? {
                    Ok(())
                } else {
                    Err(TabsplitError::not_found(TEMPLATES, &target))
                }
            })
            .await?;

        info!(id = %id, "Template deleted");
        self.gateway.emit(StorageEvent::TemplateDeleted {
            id,
            timestamp: self.gateway.now(),
        });
        Ok(())
    }

    /// Count one use of the template and stamp `lastUsed`.
    pub async fn record_usage(&self, id: &str) -> Result<Template> {
        let now = self.gateway.now();
        self.modify(id.to_string(), move |template| {
            template.usage_count += 1;
            template.last_used = now;
            template.updated_at = now.max(template.created_at);
        })
        .await
    }

    /// Every template, by primary key.
    pub async fn list(&self) -> Result<Vec<Template>> {
        self.gateway
            .read(&[TEMPLATES], |tx| tx.collect::<Template>(&CursorSpec::primary()))
            .await
    }

    pub async fn query(&self, query: TemplateQuery) -> Result<Vec<Template>> {
        self.gateway
            .read(&[TEMPLATES], move |tx| queries::query_templates(tx, &query))
            .await
    }

    async fn modify<F>(&self, id: String, change: F) -> Result<Template>
    where
        F: FnOnce(&mut Template) + Send + 'static,
    {
        let template = self
            .gateway
            .write(&[TEMPLATES], move |tx| {
                let mut template = tx
                    .get::<Template>(&id)?
                    .ok_or_else(|| TabsplitError::not_found(TEMPLATES, &id))?;
                change(&mut template);
                tx.put(&template)?;
                Ok(template)
            })
            .await?;

        self.gateway.emit(StorageEvent::TemplateUpdated {
            id: template.id.clone(),
            usage_count: template.usage_count,
            timestamp: self.gateway.now(),
        });
        Ok(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::DatabaseTarget;
    use crate::queries::{SortDirection, TemplateSortField};
    use serde_json::json;
    use tabsplit_core::config::StorageConfig;
    use tabsplit_core::types::SplitMethod;

    fn make_repo() -> TemplateRepository {
        TemplateRepository::new(Gateway::new(DatabaseTarget::Memory, StorageConfig::default()))
    }

    fn named(name: &str, tags: &[&str]) -> NewTemplate {
        NewTemplate {
            name: name.to_string(),
            participants: json!(["alice", "bob"]),
            default_split_method: SplitMethod::Percentage,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_initializes_usage() {
        let repo = make_repo();
        let id = repo.create(named("Roommates", &["home"])).await.unwrap();
        let template = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(template.usage_count, 0);
        assert_eq!(template.last_used, template.created_at);
        assert_eq!(template.default_split_method, SplitMethod::Percentage);
    }

    #[tokio::test]
    async fn test_record_usage_increments() {
        let repo = make_repo();
        let id = repo.create(named("Roommates", &[])).await.unwrap();
        let first = repo.record_usage(&id).await.unwrap();
        let second = repo.record_usage(&id).await.unwrap();
        assert_eq!(second.usage_count, 2);
        assert!(second.last_used > first.last_used);
        assert!(first.last_used > first.created_at);
    }

    #[tokio::test]
    async fn test_most_used_first() {
        let repo = make_repo();
        let mut ids = Vec::new();
        for (name, uses) in [("A", 1), ("B", 5), ("C", 2)] {
            let id = repo.create(named(name, &[])).await.unwrap();
            for _ in 0..uses {
                repo.record_usage(&id).await.unwrap();
            }
            ids.push(id);
        }

        let top = repo
            .query(TemplateQuery {
                sort: Some((TemplateSortField::UsageCount, SortDirection::Desc)),
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].name, "B");
        assert_eq!(top[0].usage_count, 5);
    }

    #[tokio::test]
    async fn test_update_keeps_usage_and_tag_filter() {
        let repo = make_repo();
        let id = repo.create(named("Trip", &["travel"])).await.unwrap();
        repo.record_usage(&id).await.unwrap();

        let updated = repo
            .update(
                &id,
                TemplatePatch {
                    tags: Some(vec!["Ski".to_string(), "travel".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.usage_count, 1);
        assert_eq!(updated.tags, vec!["Ski", "travel"]);

        let found = repo
            .query(TemplateQuery {
                tags: vec!["ski".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_and_missing() {
        let repo = make_repo();
        let id = repo.create(named("Office", &[])).await.unwrap();
        repo.delete(&id).await.unwrap();
        assert!(repo.list().await.unwrap().is_empty());

        assert!(matches!(
            repo.delete(&id).await.unwrap_err(),
            TabsplitError::NotFound { .. }
        ));
        assert!(matches!(
            repo.record_usage(&id).await.unwrap_err(),
            TabsplitError::NotFound { .. }
        ));
    }
}
