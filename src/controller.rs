//! Check-cycle orchestration: resolve, compare, pull, recreate, persist.

use crate::config::ImageTarget;
use crate::engine::EngineClient;
use crate::image_reference::references_match;
use crate::oci_registry::{RegistryResolver, ResolvedVersion};
use crate::rollout::RolloutOrchestrator;
use crate::state::{ImageState, StateStore};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Outcome of checking one tracked image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UpdateEvent {
    /// The base tag's digest moved to a different version tag.
    UpdateAvailable {
        image: String,
        base_tag: String,
        old_tag: String,
        new_tag: String,
        digest: String,
        auto_update: bool,
    },
    /// Same version tag, new digest: the image was rebuilt in place.
    ImageRebuilt {
        image: String,
        tag: String,
        digest: String,
    },
    NoUpdate {
        image: String,
        base_tag: String,
    },
    CheckError {
        image: String,
        error: String,
    },
}

/// Progress notifications emitted while a cycle runs, for callers that
/// surface live status.
#[derive(Debug)]
pub enum CycleProgress<'a> {
    Checking {
        image: &'a str,
        base_tag: &'a str,
        index: usize,
        total: usize,
    },
    Event(&'a UpdateEvent),
}

pub type ProgressCallback = dyn Fn(&CycleProgress<'_>) + Send + Sync;

pub struct UpdateCoordinator {
    engine: EngineClient,
    resolver: RegistryResolver,
    rollout: RolloutOrchestrator,
    store: StateStore,
    dry_run: bool,
}

impl UpdateCoordinator {
    pub fn new(
        engine: EngineClient,
        resolver: RegistryResolver,
        store: StateStore,
        dry_run: bool,
    ) -> Self {
        let rollout = RolloutOrchestrator::new(engine.clone());
        Self {
            engine,
            resolver,
            rollout,
            store,
            dry_run,
        }
    }

    /// Checks every target once and returns the per-image events.
    ///
    /// State only advances for an image when its update fully applied (or
    /// when `auto_update` is off, where detection alone is the job), so a
    /// failed update is retried on the next cycle. The whole map is saved
    /// once at the end, never mid-cycle.
    pub async fn run_cycle(
        &self,
        targets: &[ImageTarget],
        progress: Option<&ProgressCallback>,
    ) -> Vec<UpdateEvent> {
        let mut state = self.store.load();
        let mut events = Vec::new();
        let total = targets.len();

        for (index, target) in targets.iter().enumerate() {
            notify(
                progress,
                &CycleProgress::Checking {
                    image: &target.image,
                    base_tag: &target.base_tag,
                    index,
                    total,
                },
            );
            info!(
                "Checking {}:{} ({}/{})",
                target.image,
                target.base_tag,
                index + 1,
                total
            );

            let resolved = match self.resolver.resolve(target).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    error!("Error checking {}: {}", target.image, e);
                    let event = UpdateEvent::CheckError {
                        image: target.image.clone(),
                        error: e.to_string(),
                    };
                    notify(progress, &CycleProgress::Event(&event));
                    events.push(event);
                    continue;
                }
            };
            debug!(
                "{}:{} currently resolves to {} ({})",
                target.image, target.base_tag, resolved.tag, resolved.digest
            );

            let saved = state.get(&target.image);
            let digest_changed = saved.map(|s| s.digest != resolved.digest).unwrap_or(true);
            if !digest_changed {
                info!("No update for {}:{}", target.image, target.base_tag);
                let event = UpdateEvent::NoUpdate {
                    image: target.image.clone(),
                    base_tag: target.base_tag.clone(),
                };
                notify(progress, &CycleProgress::Event(&event));
                events.push(event);
                continue;
            }

            let old_tag = match saved {
                Some(s) if !s.tag.is_empty() => s.tag.clone(),
                _ => self
                    .probe_local_tag(target)
                    .await
                    .unwrap_or_else(|| "unknown".to_string()),
            };

            let event = if old_tag != resolved.tag {
                info!(
                    "Update available for {}:{}: {} -> {}",
                    target.image, target.base_tag, old_tag, resolved.tag
                );
                UpdateEvent::UpdateAvailable {
                    image: target.image.clone(),
                    base_tag: target.base_tag.clone(),
                    old_tag,
                    new_tag: resolved.tag.clone(),
                    digest: resolved.digest.clone(),
                    auto_update: target.auto_update,
                }
            } else {
                info!(
                    "{}:{} was rebuilt, tag {} has a new digest",
                    target.image, target.base_tag, resolved.tag
                );
                UpdateEvent::ImageRebuilt {
                    image: target.image.clone(),
                    tag: resolved.tag.clone(),
                    digest: resolved.digest.clone(),
                }
            };
            notify(progress, &CycleProgress::Event(&event));
            events.push(event);

            let update_ok = if target.auto_update {
                let containers = self.discover_containers(target).await;
                let ok = self.apply_update(target, &resolved, &containers).await;
                if ok && target.cleanup_old_images && !self.dry_run {
                    self.cleanup_old_images(target).await;
                }
                ok
            } else {
                true
            };

            if update_ok {
                state.insert(
                    target.image.clone(),
                    ImageState {
                        base_tag: target.base_tag.clone(),
                        tag: resolved.tag.clone(),
                        digest: resolved.digest.clone(),
                        last_updated: Utc::now().to_rfc3339(),
                    },
                );
            }
        }

        if self.dry_run {
            info!("Dry run, not saving state");
        } else if let Err(e) = self.store.save(&state) {
            error!("Failed to save state: {:#}", e);
        }

        events
    }

    /// Names of containers currently created from the tracked image,
    /// whatever tag they were started with.
    async fn discover_containers(&self, target: &ImageTarget) -> Vec<String> {
        let with_base = format!("{}:{}", target.image, target.base_tag);
        match self.engine.list_containers(true).await {
            Ok(containers) => {
                let mut names: Vec<String> = containers
                    .iter()
                    .filter(|c| {
                        references_match(&c.image, &target.image)
                            || references_match(&c.image, &with_base)
                    })
                    .filter_map(|c| c.name().map(str::to_owned))
                    .collect();
                names.sort_unstable();
                names
            }
            Err(e) => {
                warn!("Could not list containers: {}", e);
                Vec::new()
            }
        }
    }

    /// Best-effort recovery of the previously deployed version tag, for
    /// when no saved state exists yet. Only image IDs actually backing a
    /// matching container are considered, so a newer version that merely
    /// sits in the local store does not masquerade as the running one.
    async fn probe_local_tag(&self, target: &ImageTarget) -> Option<String> {
        let with_base = format!("{}:{}", target.image, target.base_tag);
        let containers = self.engine.list_containers(true).await.ok()?;
        let image_ids: Vec<&String> = containers
            .iter()
            .filter(|c| {
                references_match(&c.image, &target.image)
                    || references_match(&c.image, &with_base)
            })
            .map(|c| &c.image_id)
            .filter(|id| !id.is_empty())
            .collect();
        if image_ids.is_empty() {
            return None;
        }

        let images = self.engine.list_images(&target.image).await.ok()?;
        for summary in &images {
            if !image_ids.iter().any(|id| summary.id == **id) {
                continue;
            }
            for repo_tag in &summary.repo_tags {
                if let Some((_, tag)) = repo_tag.rsplit_once(':') {
                    if target.regex.is_match(tag) {
                        return Some(tag.to_string());
                    }
                }
            }
        }
        None
    }

    /// Pulls the new image and recreates its containers. The update counts
    /// as applied when the base-tag pull succeeds and, if any containers
    /// exist, at least one rollout does too.
    async fn apply_update(
        &self,
        target: &ImageTarget,
        resolved: &ResolvedVersion,
        containers: &[String],
    ) -> bool {
        if self.dry_run {
            info!(
                "Dry run: would pull {}:{} and update {} container(s)",
                target.image,
                target.base_tag,
                containers.len()
            );
            return true;
        }

        info!("Pulling {}:{}...", target.image, target.base_tag);
        if let Err(e) = self.engine.pull_image(&target.image, &target.base_tag).await {
            error!("Failed to pull {}:{}: {}", target.image, target.base_tag, e);
            return false;
        }
        // The version tag shares all blobs with the base tag just pulled, so
        // this only registers the tag locally. Not worth failing over.
        if let Err(e) = self.engine.pull_image(&target.image, &resolved.tag).await {
            warn!(
                "Could not pull version tag {}:{}: {}",
                target.image, resolved.tag, e
            );
        }

        if containers.is_empty() {
            info!("No containers run {}, nothing to recreate", target.image);
            return true;
        }

        // Containers get the concrete version tag, not the floating one, so
        // what runs stays pinned to the content that was just verified.
        let image_ref = format!("{}:{}", target.image, resolved.tag);
        let results = self.rollout.rollout_many(containers, &image_ref).await;
        results.values().any(|ok| *ok)
    }

    /// Removes version-tagged images beyond the newest `keep_versions`.
    /// In-use or already-removed images are skipped quietly.
    async fn cleanup_old_images(&self, target: &ImageTarget) {
        let images = match self.engine.list_images(&target.image).await {
            Ok(images) => images,
            Err(e) => {
                warn!(
                    "Could not list images for cleanup of {}: {}",
                    target.image, e
                );
                return;
            }
        };

        let mut versions: Vec<(i64, String)> = Vec::new();
        for summary in &images {
            for repo_tag in &summary.repo_tags {
                if let Some((_, tag)) = repo_tag.rsplit_once(':') {
                    if target.regex.is_match(tag) {
                        versions.push((summary.created, repo_tag.clone()));
                    }
                }
            }
        }

        if versions.len() <= target.keep_versions {
            return;
        }
        versions.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        for (_, repo_tag) in versions.split_off(target.keep_versions) {
            match self.engine.remove_image(&repo_tag).await {
                Ok(true) => info!("Removed old image {}", repo_tag),
                Ok(false) => debug!("Image {} already gone or in use, skipping", repo_tag),
                Err(e) => warn!("Could not remove image {}: {}", repo_tag, e),
            }
        }
    }
}

fn notify(progress: Option<&ProgressCallback>, update: &CycleProgress<'_>) {
    if let Some(callback) = progress {
        callback(update);
    }
}
