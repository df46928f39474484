//! Usage tracking and eviction of images and volumes

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::container_runtime::{ContainerRuntime, RuntimeResult};

/// Usage record of one cached resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceUsage {
    /// Last time the resource was used
    pub last_used: DateTime<Utc>,
    /// How many times it was used
    pub usage_count: u64,
    /// Required resources are never evicted
    pub required: bool,
}

/// Outcome of a resync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    /// Entries dropped because the runtime no longer has them
    pub dropped: Vec<String>,
    /// Resources deleted for being unused too long
    pub evicted: Vec<String>,
}

/// Append the default tag to untagged image references
pub fn normalize_image_ref(image: &str) -> String {
    let name = image.rsplit('/').next().unwrap_or(image);
    if image.contains('@') || name.contains(':') {
        image.to_string()
    } else {
        format!("{image}:latest")
    }
}

/// Tracks image and volume usage and evicts stale resources
#[derive(Debug)]
pub struct ResourceCache {
    images: DashMap<String, ResourceUsage>,
    volumes: DashMap<String, ResourceUsage>,
    max_idle: Duration,
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new(Duration::hours(24))
    }
}

impl ResourceCache {
    /// Create a cache evicting resources idle for longer than `max_idle`
    pub fn new(max_idle: Duration) -> Self {
        Self {
            images: DashMap::new(),
            volumes: DashMap::new(),
            max_idle,
        }
    }

    /// Record an image use
    pub fn set_image_used(&self, image: &str) {
        Self::touch(&self.images, normalize_image_ref(image));
    }

    /// Record a volume use
    pub fn set_volume_used(&self, volume: &str) {
        Self::touch(&self.volumes, volume.to_string());
    }

    /// Pin an image so it is never evicted
    pub fn mark_image_required(&self, image: &str) {
        self.images
            .entry(normalize_image_ref(image))
            .or_insert_with(|| ResourceUsage {
                last_used: Utc::now(),
                usage_count: 0,
                required: true,
            })
            .required = true;
    }

    /// Usage of an image
    pub fn image_usage(&self, image: &str) -> Option<ResourceUsage> {
        self.images
            .get(&normalize_image_ref(image))
            .map(|usage| usage.clone())
    }

    /// Usage of a volume
    pub fn volume_usage(&self, volume: &str) -> Option<ResourceUsage> {
        self.volumes.get(volume).map(|usage| usage.clone())
    }

    fn touch(map: &DashMap<String, ResourceUsage>, key: String) {
        let now = Utc::now();
        map.entry(key)
            .and_modify(|usage| {
                usage.last_used = now;
                usage.usage_count += 1;
            })
            .or_insert(ResourceUsage {
                last_used: now,
                usage_count: 1,
                required: false,
            });
    }

    /// Reconcile the cache with the runtime and evict stale resources
    pub async fn resync(&self, runtime: &dyn ContainerRuntime) -> RuntimeResult<ResyncReport> {
        self.resync_at(runtime, Utc::now()).await
    }

    /// [`resync`](Self::resync) against an explicit clock
    pub async fn resync_at(
        &self,
        runtime: &dyn ContainerRuntime,
        now: DateTime<Utc>,
    ) -> RuntimeResult<ResyncReport> {
        let mut report = ResyncReport::default();

        let images: HashSet<String> = runtime
            .list_images()
            .await?
            .iter()
            .map(|image| normalize_image_ref(image))
            .collect();
        for image in self.reconcile(&self.images, &images, now, &mut report) {
            match runtime.delete_image(&image).await {
                Ok(()) => {
                    self.images.remove(&image);
                    report.evicted.push(image);
                }
                Err(err) => warn!(image = %image, error = %err, "Failed to evict image"),
            }
        }

        let volumes: HashSet<String> = runtime.list_volumes().await?.into_iter().collect();
        for volume in self.reconcile(&self.volumes, &volumes, now, &mut report) {
            match runtime.delete_volume(&volume).await {
                Ok(()) => {
                    self.volumes.remove(&volume);
                    report.evicted.push(volume);
                }
                Err(err) => warn!(volume = %volume, error = %err, "Failed to evict volume"),
            }
        }

        info!(
            dropped = report.dropped.len(),
            evicted = report.evicted.len(),
            "Resource cache resynced"
        );
        Ok(report)
    }

    // Drops entries the runtime no longer has and returns the stale ones.
    fn reconcile(
        &self,
        map: &DashMap<String, ResourceUsage>,
        present: &HashSet<String>,
        now: DateTime<Utc>,
        report: &mut ResyncReport,
    ) -> Vec<String> {
        let gone: Vec<String> = map
            .iter()
            .filter(|entry| !present.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for key in gone {
            debug!(resource = %key, "Dropping cache entry for missing resource");
            map.remove(&key);
            report.dropped.push(key);
        }

        map.iter()
            .filter(|entry| !entry.required && now - entry.last_used > self.max_idle)
            .map(|entry| entry.key().clone())
            .collect()
    }
}
