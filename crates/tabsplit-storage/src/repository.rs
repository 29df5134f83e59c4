//! Repositories for calculations and their receipt images.
//!
//! Every mutating method runs as one transaction through the gateway and
//! emits exactly one event after it commits. Images are owned by a
//! calculation: they are created with it, copied with it and deleted with it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, info};

use tabsplit_core::error::{Result, TabsplitError};
use tabsplit_core::events::StorageEvent;
use tabsplit_core::types::{
    new_record_id, normalize_tags, Calculation, CalculationPatch, NewCalculation, NewImage,
    ReceiptImage, RecordId,
};

use crate::gateway::Gateway;
use crate::queries::{self, CalculationQuery, CalculationSortField, SortDirection};
use crate::schema::{index, Document, CALCULATIONS, IMAGES};
use crate::tx::{CursorSpec, CursorStep, KeyRange, Tx};

fn require_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(TabsplitError::InvalidData(
            "Calculation name must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Delete a calculation and every image stored under its id.
///
/// Returns `None` (and touches nothing) when the calculation does not exist,
/// otherwise the number of images removed.
pub(crate) fn delete_cascade(tx: &Tx<'_>, id: &str) -> Result<Option<usize>> {
    if !tx.delete::<Calculation>(id)? {
        return Ok(None);
    }
    let image_ids = tx.keys::<ReceiptImage>(
        &CursorSpec::on(index::CALCULATION_ID).range(KeyRange::only(id)),
    )?;
    for image_id in &image_ids {
        tx.delete::<ReceiptImage>(image_id)?;
    }
    Ok(Some(image_ids.len()))
}

/// Repository for saved calculations.
pub struct CalculationRepository {
    gateway: Arc<Gateway>,
}

impl CalculationRepository {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Store a new calculation together with its images. Returns the new id.
    pub async fn create(&self, input: NewCalculation) -> Result<RecordId> {
        require_name(&input.name)?;

        let now = self.gateway.now();
        let mut calc = Calculation {
            id: new_record_id(),
            name: input.name,
            description: input.description,
            bill_data: input.bill_data,
            split_result: input.split_result,
            images: Vec::new(),
            created_at: now,
            updated_at: now,
            tags: normalize_tags(&input.tags),
            is_starred: input.is_starred,
            version: 1,
        };
        let uploads = input.images;

        let calc = self
            .gateway
            .write(&[CALCULATIONS, IMAGES], move |tx| {
                if !tx.add(&calc)? {
                    return Err(TabsplitError::Storage(format!(
                        "Calculation id {} already exists",
                        calc.id
                    )));
                }
                for upload in uploads {
                    let image = ReceiptImage::from_upload(upload, &calc.id, now);
                    add_new(tx, &image)?;
                    calc.images.push(image.to_ref());
                }
                tx.put(&calc)?;
                Ok(calc)
            })
            .await?;

        info!(id = %calc.id, images = calc.images.len(), "Calculation created");
        self.gateway.emit(StorageEvent::CalculationCreated {
            id: calc.id.clone(),
            name: calc.name.clone(),
            image_count: calc.images.len(),
            timestamp: self.gateway.now(),
        });
        Ok(calc.id)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Calculation>> {
        let id = id.to_string();
        self.gateway
            .read(&[CALCULATIONS], move |tx| tx.get::<Calculation>(&id))
            .await
    }

    /// Merge `patch` into a stored calculation and bump its version.
    pub async fn update(&self, id: &str, patch: CalculationPatch) -> Result<Calculation> {
        if let Some(name) = &patch.name {
            require_name(name)?;
        }
        let now = self.gateway.now();
        let id = id.to_string();

        let calc = self
            .gateway
            .write(&[CALCULATIONS], move |tx| {
                let mut calc = tx
                    .get::<Calculation>(&id)?
                    .ok_or_else(|| TabsplitError::not_found(CALCULATIONS, &id))?;
                calc.apply(patch);
                touch(&mut calc, now);
                tx.put(&calc)?;
                Ok(calc)
            })
            .await?;

        debug!(id = %calc.id, version = calc.version, "Calculation updated");
        self.emit_updated(&calc);
        Ok(calc)
    }

    /// Delete a calculation and its images in one transaction.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        let target = id.clone();
        let images_removed = self
            .gateway
            .write(&[CALCULATIONS, IMAGES], move |tx| {
                delete_cascade(tx, &target)?
                    .ok_or_else(|| TabsplitError::not_found(CALCULATIONS, &target))
            })
            .await?;

        info!(id = %id, images_removed, "Calculation deleted");
        self.gateway.emit(StorageEvent::CalculationDeleted {
            id,
            images_removed,
            timestamp: self.gateway.now(),
        });
        Ok(())
    }

    /// Flip the starred flag. Returns the new value.
    pub async fn toggle_star(&self, id: &str) -> Result<bool> {
        let now = self.gateway.now();
        let id = id.to_string();
        let calc = self
            .gateway
            .write(&[CALCULATIONS], move |tx| {
                let mut calc = tx
                    .get::<Calculation>(&id)?
                    .ok_or_else(|| TabsplitError::not_found(CALCULATIONS, &id))?;
                calc.is_starred = !calc.is_starred;
                touch(&mut calc, now);
                tx.put(&calc)?;
                Ok(calc)
            })
            .await?;

        self.emit_updated(&calc);
        Ok(calc.is_starred)
    }

    /// Copy a calculation and its images under fresh ids. The copy is named
    /// `name`, or "<original> (copy)" when no name is given.
    pub async fn duplicate(&self, id: &str, name: Option<String>) -> Result<RecordId> {
        if let Some(name) = &name {
            require_name(name)?;
        }
        let now = self.gateway.now();
        let id = id.to_string();

        let copy = self
            .gateway
            .write(&[CALCULATIONS, IMAGES], move |tx| {
                let source = tx
                    .get::<Calculation>(&id)?
                    .ok_or_else(|| TabsplitError::not_found(CALCULATIONS, &id))?;

                let mut copy = Calculation {
                    id: new_record_id(),
                    name: name.unwrap_or_else(|| format!("{} (copy)", source.name)),
                    images: Vec::with_capacity(source.images.len()),
                    created_at: now,
                    updated_at: now,
                    version: 1,
                    ..source.clone()
                };
                for image_ref in &source.images {
                    // Dangling references are dropped from the copy.
                    let Some(image) = tx.get::<ReceiptImage>(&image_ref.id)? else {
                        continue;
                    };
                    let cloned = ReceiptImage {
                        id: new_record_id(),
                        calculation_id: copy.id.clone(),
                        created_at: now,
                        ..image
                    };
                    add_new(tx, &cloned)?;
                    copy.images.push(cloned.to_ref());
                }
                add_new(tx, &copy)?;
                Ok(copy)
            })
            .await?;

        info!(id = %copy.id, images = copy.images.len(), "Calculation duplicated");
        self.gateway.emit(StorageEvent::CalculationCreated {
            id: copy.id.clone(),
            name: copy.name.clone(),
            image_count: copy.images.len(),
            timestamp: self.gateway.now(),
        });
        Ok(copy.id)
    }

    /// Every tag in use, sorted.
    pub async fn list_tags(&self) -> Result<Vec<String>> {
        self.gateway
            .read(&[CALCULATIONS], |tx| {
                let mut tags = BTreeSet::new();
                tx.cursor(&CursorSpec::primary(), |calc: Calculation| {
                    tags.extend(calc.tags);
                    Ok(CursorStep::Continue)
                })?;
                Ok(tags.into_iter().collect())
            })
            .await
    }

    pub async fn count(&self) -> Result<u64> {
        self.gateway
            .read(&[CALCULATIONS], |tx| tx.count::<Calculation>())
            .await
    }

    /// The most recently created calculations, newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<Calculation>> {
        self.query(CalculationQuery {
            sort: Some((CalculationSortField::CreatedAt, SortDirection::Desc)),
            limit: Some(limit),
            ..Default::default()
        })
        .await
    }

    pub async fn query(&self, query: CalculationQuery) -> Result<Vec<Calculation>> {
        self.gateway
            .read(&[CALCULATIONS], move |tx| {
                queries::query_calculations(tx, &query)
            })
            .await
    }

    fn emit_updated(&self, calc: &Calculation) {
        self.gateway.emit(StorageEvent::CalculationUpdated {
            id: calc.id.clone(),
            version: calc.version,
            timestamp: self.gateway.now(),
        });
    }
}

/// Insert `record`, failing if its key is already taken.
fn add_new<D: Document>(tx: &Tx<'_>, record: &D) -> Result<()> {
    if tx.add(record)? {
        Ok(())
    } else {
        Err(TabsplitError::Storage(format!(
            "{} id {} already exists",
            D::COLLECTION,
            record.key()
        )))
    }
}

fn touch(calc: &mut Calculation, now: chrono::DateTime<chrono::Utc>) {
    calc.updated_at = now.max(calc.created_at);
    calc.version += 1;
}

/// Repository for receipt images.
pub struct ImageRepository {
    gateway: Arc<Gateway>,
}

impl ImageRepository {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    pub async fn get(&self, id: &str) -> Result<Option<ReceiptImage>> {
        let id = id.to_string();
        self.gateway
            .read(&[IMAGES], move |tx| tx.get::<ReceiptImage>(&id))
            .await
    }

    /// Images of a calculation in the order its references list them.
    /// Images stored under the id but not referenced come last.
    pub async fn list_for_calculation(&self, calculation_id: &str) -> Result<Vec<ReceiptImage>> {
        let calculation_id = calculation_id.to_string();
        self.gateway
            .read(&[CALCULATIONS, IMAGES], move |tx| {
                let stored = tx.collect::<ReceiptImage>(
                    &CursorSpec::on(index::CALCULATION_ID)
                        .range(KeyRange::only(calculation_id.as_str())),
                )?;
                let order: Vec<RecordId> = tx
                    .get::<Calculation>(&calculation_id)?
                    .map(|calc| calc.images.into_iter().map(|r| r.id).collect())
                    .unwrap_or_default();

                let mut by_id: HashMap<RecordId, ReceiptImage> =
                    stored.into_iter().map(|image| (image.id.clone(), image)).collect();
                let mut images: Vec<ReceiptImage> =
                    order.iter().filter_map(|id| by_id.remove(id)).collect();
                let mut rest: Vec<ReceiptImage> = by_id.into_values().collect();
                rest.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                images.extend(rest);
                Ok(images)
            })
            .await
    }

    /// Add an image to an existing calculation. Returns the image id.
    pub async fn attach(&self, calculation_id: &str, upload: NewImage) -> Result<RecordId> {
        let now = self.gateway.now();
        let calculation_id = calculation_id.to_string();

        let (image_id, calc) = self
            .gateway
            .write(&[CALCULATIONS, IMAGES], move |tx| {
                let mut calc = tx
                    .get::<Calculation>(&calculation_id)?
                    .ok_or_else(|| TabsplitError::not_found(CALCULATIONS, &calculation_id))?;
                let image = ReceiptImage::from_upload(upload, &calc.id, now);
                add_new(tx, &image)?;
                calc.images.push(image.to_ref());
                touch(&mut calc, now);
                tx.put(&calc)?;
                Ok((image.id, calc))
            })
            .await?;

        debug!(image = %image_id, calculation = %calc.id, "Image attached");
        self.gateway.emit(StorageEvent::CalculationUpdated {
            id: calc.id,
            version: calc.version,
            timestamp: self.gateway.now(),
        });
        Ok(image_id)
    }

    /// Delete an image and its reference from the owning calculation.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let now = self.gateway.now();
        let id = id.to_string();

        let owner = self
            .gateway
            .write(&[CALCULATIONS, IMAGES], move |tx| {
                let image = tx
                    .get::<ReceiptImage>(&id)?
                    .ok_or_else(|| TabsplitError::not_found(IMAGES, &id))?;
                tx.delete::<ReceiptImage>(&id)?;

                let Some(mut calc) = tx.get::<Calculation>(&image.calculation_id)? else {
                    return Ok(None);
                };
                calc.images.retain(|r| r.id != id);
                touch(&mut calc, now);
                tx.put(&calc)?;
                Ok(Some(calc))
            })
            .await?;

        if let Some(calc) = owner {
            self.gateway.emit(StorageEvent::CalculationUpdated {
                id: calc.id,
                version: calc.version,
                timestamp: self.gateway.now(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::DatabaseTarget;
    use serde_json::json;
    use std::sync::Mutex;
    use tabsplit_core::config::StorageConfig;
    use tabsplit_core::events::EventKind;

    fn make_gateway() -> Arc<Gateway> {
        Gateway::new(DatabaseTarget::Memory, StorageConfig::default())
    }

    fn upload(name: &str, bytes: usize) -> NewImage {
        NewImage {
            name: name.to_string(),
            mime_type: "image/jpeg".to_string(),
            data: vec![42; bytes],
            ..Default::default()
        }
    }

    fn dinner(images: Vec<NewImage>) -> NewCalculation {
        NewCalculation {
            name: "Dinner".to_string(),
            bill_data: json!({"total": 84.5}),
            split_result: json!({"alice": 42.25, "bob": 42.25}),
            images,
            tags: vec![" food ".to_string(), "friends".to_string(), "food".to_string()],
            ..Default::default()
        }
    }

    /// Record every event kind the bus delivers.
    fn record_events(gateway: &Gateway) -> Arc<Mutex<Vec<EventKind>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in EventKind::ALL {
            let seen = Arc::clone(&seen);
            gateway.events().subscribe(kind, move |event| {
                seen.lock().unwrap().push(event.kind());
            });
        }
        seen
    }

    async fn image_count(gateway: &Arc<Gateway>) -> u64 {
        gateway
            .read(&[IMAGES], |tx| tx.count::<ReceiptImage>())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let gateway = make_gateway();
        let repo = CalculationRepository::new(Arc::clone(&gateway));
        let id = repo
            .create(dinner(vec![upload("a.jpg", 500), upload("b.jpg", 800)]))
            .await
            .unwrap();

        let calc = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(calc.name, "Dinner");
        assert_eq!(calc.version, 1);
        assert_eq!(calc.tags, vec!["food", "friends"]);
        assert_eq!(calc.images.len(), 2);
        assert_eq!(calc.image_bytes(), 1300);
        assert_eq!(calc.created_at, calc.updated_at);

        let images = ImageRepository::new(gateway)
            .list_for_calculation(&id)
            .await
            .unwrap();
        let names: Vec<&str> = images.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a.jpg", "b.jpg"]);
        assert_eq!(images[0].data.len(), 500);
    }

    #[tokio::test]
    async fn test_create_rejects_blank_name_without_event() {
        let gateway = make_gateway();
        let events = record_events(&gateway);
        let repo = CalculationRepository::new(Arc::clone(&gateway));

        let err = repo
            .create(NewCalculation {
                name: "   ".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TabsplitError::InvalidData(_)));
        assert_eq!(repo.count().await.unwrap(), 0);
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quota_failure_leaves_nothing_behind() {
        let gateway = Gateway::new(
            DatabaseTarget::Memory,
            StorageConfig {
                quota_kb: 256,
                ..Default::default()
            },
        );
        let events = record_events(&gateway);
        let repo = CalculationRepository::new(Arc::clone(&gateway));

        let err = repo
            .create(dinner(vec![upload("small.jpg", 1024), upload("huge.jpg", 300 * 1024)]))
            .await
            .unwrap_err();
        assert!(matches!(err, TabsplitError::QuotaExceeded(_)));
        assert_eq!(repo.count().await.unwrap(), 0);
        assert_eq!(image_count(&gateway).await, 0);
        assert_eq!(
            *events.lock().unwrap(),
            vec![EventKind::StorageQuotaWarning]
        );
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_timestamp() {
        let gateway = make_gateway();
        let repo = CalculationRepository::new(gateway);
        let id = repo.create(dinner(vec![])).await.unwrap();
        let before = repo.get(&id).await.unwrap().unwrap();

        let mut last_version = before.version;
        for name in ["Lunch", "Brunch", "Supper"] {
            let updated = repo
                .update(
                    &id,
                    CalculationPatch {
                        name: Some(name.to_string()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert!(updated.version > last_version);
            last_version = updated.version;
        }

        let after = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(after.version, 4);
        assert_eq!(after.name, "Supper");
        assert_eq!(after.created_at, before.created_at);
        assert!(after.updated_at > before.updated_at);
        assert_eq!(after.bill_data, before.bill_data);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let repo = CalculationRepository::new(make_gateway());
        let err = repo
            .update("nope", CalculationPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TabsplitError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_cascades_images() {
        let gateway = make_gateway();
        let events = record_events(&gateway);
        let repo = CalculationRepository::new(Arc::clone(&gateway));
        let keep = repo.create(dinner(vec![upload("keep.jpg", 10)])).await.unwrap();
        let doomed = repo
            .create(dinner(vec![upload("a.jpg", 10), upload("b.jpg", 10)]))
            .await
            .unwrap();
        assert_eq!(image_count(&gateway).await, 3);

        repo.delete(&doomed).await.unwrap();
        assert!(repo.get(&doomed).await.unwrap().is_none());
        assert_eq!(image_count(&gateway).await, 1);
        assert!(repo.get(&keep).await.unwrap().is_some());

        let err = repo.delete(&doomed).await.unwrap_err();
        assert!(matches!(err, TabsplitError::NotFound { .. }));

        let kinds = events.lock().unwrap().clone();
        assert_eq!(
            kinds,
            vec![
                EventKind::CalculationCreated,
                EventKind::CalculationCreated,
                EventKind::CalculationDeleted,
            ]
        );
    }

    #[tokio::test]
    async fn test_toggle_star() {
        let repo = CalculationRepository::new(make_gateway());
        let id = repo.create(dinner(vec![])).await.unwrap();
        assert!(repo.toggle_star(&id).await.unwrap());
        assert!(!repo.toggle_star(&id).await.unwrap());
        assert_eq!(repo.get(&id).await.unwrap().unwrap().version, 3);
    }

    #[tokio::test]
    async fn test_duplicate_copies_images() {
        let gateway = make_gateway();
        let repo = CalculationRepository::new(Arc::clone(&gateway));
        let id = repo.create(dinner(vec![upload("a.jpg", 64)])).await.unwrap();

        let copy_id = repo.duplicate(&id, None).await.unwrap();
        assert_ne!(copy_id, id);
        let copy = repo.get(&copy_id).await.unwrap().unwrap();
        assert_eq!(copy.name, "Dinner (copy)");
        assert_eq!(copy.version, 1);
        assert_eq!(copy.images.len(), 1);
        assert_eq!(image_count(&gateway).await, 2);

        // The copy survives deletion of its source.
        repo.delete(&id).await.unwrap();
        let images = ImageRepository::new(gateway)
            .list_for_calculation(&copy_id)
            .await
            .unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].data, vec![42; 64]);
    }

    #[tokio::test]
    async fn test_list_tags_and_recent() {
        let repo = CalculationRepository::new(make_gateway());
        repo.create(dinner(vec![])).await.unwrap();
        let second = repo
            .create(NewCalculation {
                name: "Taxi".to_string(),
                tags: vec!["travel".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(
            repo.list_tags().await.unwrap(),
            vec!["food", "friends", "travel"]
        );
        let recent = repo.recent(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, second);
    }

    #[tokio::test]
    async fn test_attach_and_delete_image_update_owner() {
        let gateway = make_gateway();
        let calcs = CalculationRepository::new(Arc::clone(&gateway));
        let images = ImageRepository::new(Arc::clone(&gateway));
        let id = calcs.create(dinner(vec![upload("a.jpg", 5)])).await.unwrap();

        let events = record_events(&gateway);
        let image_id = images.attach(&id, upload("b.jpg", 7)).await.unwrap();
        let calc = calcs.get(&id).await.unwrap().unwrap();
        assert_eq!(calc.version, 2);
        assert_eq!(calc.images.last().unwrap().id, image_id);

        images.delete(&image_id).await.unwrap();
        let calc = calcs.get(&id).await.unwrap().unwrap();
        assert_eq!(calc.version, 3);
        assert_eq!(calc.images.len(), 1);
        assert!(images.get(&image_id).await.unwrap().is_none());

        assert_eq!(
            *events.lock().unwrap(),
            vec![EventKind::CalculationUpdated, EventKind::CalculationUpdated]
        );

        let err = images.attach("missing", upload("c.jpg", 1)).await.unwrap_err();
        assert!(matches!(err, TabsplitError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_colliding_image_id_is_rejected() {
        let gateway = make_gateway();
        let calcs = CalculationRepository::new(Arc::clone(&gateway));
        let id = calcs.create(dinner(vec![upload("a.jpg", 5)])).await.unwrap();
        let image_id = calcs.get(&id).await.unwrap().unwrap().images[0].id.clone();

        let now = gateway.now();
        let taken = image_id.clone();
        let err = gateway
            .write(&[IMAGES], move |tx| {
                let mut other = ReceiptImage::from_upload(upload("b.jpg", 3), "elsewhere", now);
                other.id = taken;
                add_new(tx, &other)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TabsplitError::Storage(_)));

        let kept = ImageRepository::new(gateway).get(&image_id).await.unwrap().unwrap();
        assert_eq!(kept.calculation_id, id);
        assert_eq!(kept.size, 5);
    }
}
