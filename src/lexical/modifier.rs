//! Mutation routing.
//!
//! [`IndexModifier`] is the entry point for per-document term changes while a
//! segment is being built. Changes to an updatable field go straight into the
//! dynamic trees of the target segment. Changes to any other configured field
//! target an older, sealed segment and are logged by the field's
//! [`PatchWriter`], which records them on behalf of the building segment.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::RwLock;

use crate::error::{Result, SegpatchError};
use crate::lexical::SegmentId;
use crate::lexical::config::{FieldUpdateConfig, UpdateConfig};
use crate::lexical::core::doc_delta::DocId;
use crate::lexical::core::term_key::TermKey;
use crate::lexical::dynamic::index::DynamicIndexSegment;
use crate::lexical::dynamic::resource::PersistedResources;
use crate::lexical::patch::buffer::{PatchFileInfo, UpdateOutcome};
use crate::lexical::patch::writer::PatchWriter;
use crate::storage::Storage;

/// Routes updates to patch writers or dynamic trees.
#[derive(Debug)]
pub struct IndexModifier {
    config: UpdateConfig,
    building_segment: SegmentId,
    patch_writers: RwLock<BTreeMap<String, Arc<PatchWriter>>>,
    dynamic: RwLock<BTreeMap<(SegmentId, String), Arc<DynamicIndexSegment>>>,
}

impl IndexModifier {
    /// Create a modifier for the segment currently being built.
    pub fn new(config: UpdateConfig, building_segment: SegmentId) -> Result<Self> {
        config.validate()?;
        Ok(IndexModifier {
            config,
            building_segment,
            patch_writers: RwLock::new(BTreeMap::new()),
            dynamic: RwLock::new(BTreeMap::new()),
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    /// Segment recording patches.
    pub fn building_segment(&self) -> SegmentId {
        self.building_segment
    }

    /// Record that `doc_id` of `segment` gained (`is_delete == false`) or lost
    /// `term` in `field`.
    pub fn update(
        &self,
        field: &str,
        segment: SegmentId,
        doc_id: DocId,
        term: TermKey,
        is_delete: bool,
    ) -> Result<UpdateOutcome> {
        let field_config = self.field_config(field)?;

        if field_config.updatable {
            self.dynamic_index(field, segment)
                .update(doc_id, term, is_delete)?;
            return Ok(UpdateOutcome::Applied);
        }

        if segment >= self.building_segment {
            return Err(SegpatchError::invalid_argument(format!(
                "field {field}: segment {segment} is not sealed (building {})",
                self.building_segment
            )));
        }

        let outcome = self
            .patch_writer_for(field_config)
            .update(segment, doc_id, term, is_delete)?;
        Ok(outcome)
    }

    /// Patch writer of `field`, if it recorded anything.
    pub fn patch_writer(&self, field: &str) -> Option<Arc<PatchWriter>> {
        self.patch_writers.read().get(field).cloned()
    }

    /// Dynamic index of `field` in `segment`, if it was updated.
    pub fn dynamic_segment(&self, field: &str, segment: SegmentId) -> Option<Arc<DynamicIndexSegment>> {
        self.dynamic
            .read()
            .get(&(segment, field.to_string()))
            .cloned()
    }

    /// Whether any patch writer holds undumped updates.
    pub fn has_pending_patches(&self) -> bool {
        self.patch_writers
            .read()
            .values()
            .any(|writer| writer.is_dirty())
    }

    /// Dump every patch writer, in field order.
    pub fn dump_patches(&self, storage: &dyn Storage) -> Result<Vec<PatchFileInfo>> {
        let writers: Vec<Arc<PatchWriter>> = self.patch_writers.read().values().cloned().collect();

        let mut infos = Vec::new();
        for writer in writers {
            infos.extend(writer.dump_all(storage)?);
        }
        Ok(infos)
    }

    /// Hand the dynamic indexes of `segment` over to `resources`. Returns the
    /// registered resource names.
    pub fn dump_dynamic(
        &self,
        segment: SegmentId,
        resources: &PersistedResources,
    ) -> Result<Vec<String>> {
        let indexes: Vec<Arc<DynamicIndexSegment>> = self
            .dynamic
            .read()
            .iter()
            .filter(|((seg, _), _)| *seg == segment)
            .map(|(_, index)| Arc::clone(index))
            .collect();

        let names = indexes
            .iter()
            .map(|index| index.dump(resources))
            .collect::<Result<Vec<_>>>()?;
        info!(
            "segment {segment}: handed off {} dynamic indexes",
            names.len()
        );
        Ok(names)
    }

    fn field_config(&self, field: &str) -> Result<&FieldUpdateConfig> {
        self.config.field(field).ok_or_else(|| {
            warn!("update for unconfigured field {field}");
            SegpatchError::invalid_argument(format!("field {field} is not configured for updates"))
        })
    }

    fn patch_writer_for(&self, field: &FieldUpdateConfig) -> Arc<PatchWriter> {
        if let Some(writer) = self.patch_writers.read().get(&field.name) {
            return Arc::clone(writer);
        }

        let mut writers = self.patch_writers.write();
        let writer = writers.entry(field.name.clone()).or_insert_with(|| {
            Arc::new(PatchWriter::new(
                &field.name,
                self.building_segment,
                field.shard_count,
                self.config.patch.compression,
            ))
        });
        Arc::clone(writer)
    }

    fn dynamic_index(&self, field: &str, segment: SegmentId) -> Arc<DynamicIndexSegment> {
        let key = (segment, field.to_string());
        if let Some(index) = self.dynamic.read().get(&key) {
            return Arc::clone(index);
        }

        let mut dynamic = self.dynamic.write();
        let index = dynamic.entry(key).or_insert_with(|| {
            Arc::new(DynamicIndexSegment::new(
                field,
                segment,
                &self.config.dynamic,
            ))
        });
        Arc::clone(index)
    }
}
