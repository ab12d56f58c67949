//! In-process image index with id/tag/digest lookup paths and a cached
//! latest pointer per `(repository, branch)`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::info;

use crate::image::Image;
use crate::util::now_ts;

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    pub max_images_per_branch: usize,
    pub max_image_age: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_images_per_branch: 5,
            max_image_age: Duration::from_secs(7 * 86_400),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ImageQuery {
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub latest_only: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<String, Image>,
    id_by_tag: HashMap<String, String>,
    id_by_digest: HashMap<String, String>,
    /// `"repo:branch"` → image id.
    latest: HashMap<String, String>,
}

pub struct ImageRegistry {
    config: RegistryConfig,
    inner: Mutex<RegistryInner>,
}

fn branch_key(repository: &str, branch: &str) -> String {
    format!("{repository}:{branch}")
}

impl ImageRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Register a built image. The newest `built_at` for a `(repository,
    /// branch)` becomes latest (ties: new image wins); the previously latest
    /// image is demoted. Re-registering an existing id is a no-op.
    pub fn register(&self, mut image: Image) -> Image {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.by_id.get(&image.id) {
            return existing.clone();
        }

        let key = branch_key(&image.repository, &image.branch);
        let current_latest = inner
            .latest
            .get(&key)
            .and_then(|id| inner.by_id.get(id))
            .cloned();

        image.is_latest = match &current_latest {
            Some(latest) => image.built_at >= latest.built_at,
            None => true,
        };

        if image.is_latest {
            if let Some(previous) = current_latest {
                if let Some(entry) = inner.by_id.get_mut(&previous.id) {
                    entry.is_latest = false;
                }
            }
            inner.latest.insert(key, image.id.clone());
        }

        inner.id_by_tag.insert(image.tag.clone(), image.id.clone());
        inner
            .id_by_digest
            .insert(image.digest.clone(), image.id.clone());
        inner.by_id.insert(image.id.clone(), image.clone());
        info!(
            "registry: registered image {} ({}) latest={}",
            image.id, image.tag, image.is_latest
        );
        image
    }

    pub fn get(&self, id: &str) -> Option<Image> {
        self.inner.lock().unwrap().by_id.get(id).cloned()
    }

    pub fn get_by_tag(&self, tag: &str) -> Option<Image> {
        let inner = self.inner.lock().unwrap();
        inner
            .id_by_tag
            .get(tag)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    pub fn get_by_digest(&self, digest: &str) -> Option<Image> {
        let inner = self.inner.lock().unwrap();
        inner
            .id_by_digest
            .get(digest)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    pub fn latest(&self, repository: &str, branch: &str) -> Option<Image> {
        let inner = self.inner.lock().unwrap();
        inner
            .latest
            .get(&branch_key(repository, branch))
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// Delete an image by id. Deleting the latest promotes the most recent
    /// remaining member of the same `(repository, branch)`.
    pub fn delete(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        Self::delete_locked(&mut inner, id)
    }

    fn delete_locked(inner: &mut RegistryInner, id: &str) -> bool {
        let Some(image) = inner.by_id.remove(id) else {
            return false;
        };
        inner.id_by_tag.remove(&image.tag);
        inner.id_by_digest.remove(&image.digest);

        let key = branch_key(&image.repository, &image.branch);
        if image.is_latest {
            let successor = inner
                .by_id
                .values()
                .filter(|i| i.repository == image.repository && i.branch == image.branch)
                .max_by_key(|i| i.built_at)
                .map(|i| i.id.clone());
            match successor {
                Some(successor_id) => {
                    if let Some(entry) = inner.by_id.get_mut(&successor_id) {
                        entry.is_latest = true;
                    }
                    inner.latest.insert(key, successor_id);
                }
                None => {
                    inner.latest.remove(&key);
                }
            }
        }
        true
    }

    /// Retention pass. For each `(repository, branch)`: keep the newest
    /// `max_images_per_branch`, drop anything older than `max_image_age`,
    /// never delete the latest. Returns the deleted ids.
    pub fn cleanup(&self) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        let cutoff = now_ts().saturating_sub(self.config.max_image_age.as_secs());

        let mut groups: HashMap<String, Vec<(String, u64, bool)>> = HashMap::new();
        for image in inner.by_id.values() {
            groups
                .entry(branch_key(&image.repository, &image.branch))
                .or_default()
                .push((image.id.clone(), image.built_at, image.is_latest));
        }

        let mut doomed = Vec::new();
        for members in groups.values_mut() {
            members.sort_by(|a, b| b.1.cmp(&a.1));
            for (index, (id, built_at, is_latest)) in members.iter().enumerate() {
                if *is_latest {
                    continue;
                }
                if index >= self.config.max_images_per_branch || *built_at < cutoff {
                    doomed.push(id.clone());
                }
            }
        }

        for id in &doomed {
            Self::delete_locked(&mut inner, id);
        }
        if !doomed.is_empty() {
            info!("registry: retention removed {} image(s)", doomed.len());
        }
        doomed
    }

    /// List images sorted by `built_at` descending.
    pub fn list(&self, query: &ImageQuery) -> Vec<Image> {
        let inner = self.inner.lock().unwrap();
        let mut images: Vec<Image> = inner
            .by_id
            .values()
            .filter(|i| {
                query
                    .repository
                    .as_deref()
                    .is_none_or(|r| i.repository == r)
                    && query.branch.as_deref().is_none_or(|b| i.branch == b)
                    && (!query.latest_only || i.is_latest)
            })
            .cloned()
            .collect();
        images.sort_by(|a, b| b.built_at.cmp(&a.built_at));
        images
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ImageRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::generate_tag;

    fn image(id: &str, built_at: u64) -> Image {
        Image {
            id: id.to_string(),
            tag: generate_tag(None, "acme", "app", "main", Some(built_at)),
            digest: format!("sha256:{id}"),
            repository: "acme/app".into(),
            branch: "main".into(),
            commit: "deadbeef".into(),
            built_at,
            size_bytes: None,
            services: Vec::new(),
            is_latest: false,
            labels: HashMap::new(),
        }
    }

    fn assert_latest_unique(registry: &ImageRegistry, repository: &str, branch: &str) {
        let members = registry.list(&ImageQuery {
            repository: Some(repository.into()),
            branch: Some(branch.into()),
            ..Default::default()
        });
        if members.is_empty() {
            return;
        }
        let latest_count = members.iter().filter(|i| i.is_latest).count();
        assert_eq!(latest_count, 1, "exactly one latest per (repo, branch)");
    }

    #[test]
    fn newer_registration_demotes_previous_latest() {
        let registry = ImageRegistry::default();
        let first = registry.register(image("img-1", 1000));
        assert!(first.is_latest);

        let second = registry.register(image("img-2", 2000));
        assert!(second.is_latest);
        assert!(!registry.get("img-1").unwrap().is_latest);
        assert_latest_unique(&registry, "acme/app", "main");
    }

    #[test]
    fn tie_on_built_at_goes_to_new_image() {
        let registry = ImageRegistry::default();
        registry.register(image("img-1", 1000));
        let second = registry.register(image("img-2", 1000));
        assert!(second.is_latest);
        assert!(!registry.get("img-1").unwrap().is_latest);
    }

    #[test]
    fn older_registration_does_not_take_latest() {
        let registry = ImageRegistry::default();
        registry.register(image("img-2", 2000));
        let older = registry.register(image("img-1", 1000));
        assert!(!older.is_latest);
        assert!(registry.get("img-2").unwrap().is_latest);
    }

    #[test]
    fn register_is_idempotent_on_id_collision() {
        let registry = ImageRegistry::default();
        registry.register(image("img-1", 1000));
        registry.register(image("img-1", 9999));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("img-1").unwrap().built_at, 1000);
    }

    #[test]
    fn lookups_by_tag_and_digest() {
        let registry = ImageRegistry::default();
        let stored = registry.register(image("img-1", 1000));
        assert_eq!(registry.get_by_tag(&stored.tag).unwrap().id, "img-1");
        assert_eq!(registry.get_by_digest("sha256:img-1").unwrap().id, "img-1");
        assert_eq!(registry.latest("acme/app", "main").unwrap().id, "img-1");
    }

    #[test]
    fn delete_latest_promotes_most_recent_remaining() {
        let registry = ImageRegistry::default();
        registry.register(image("img-1", 1000));
        registry.register(image("img-2", 2000));
        registry.register(image("img-3", 3000));

        assert!(registry.delete("img-3"));
        let promoted = registry.latest("acme/app", "main").unwrap();
        assert_eq!(promoted.id, "img-2");
        assert!(promoted.is_latest);
        assert_latest_unique(&registry, "acme/app", "main");
    }

    #[test]
    fn delete_last_member_clears_latest_pointer() {
        let registry = ImageRegistry::default();
        registry.register(image("img-1", 1000));
        assert!(registry.delete("img-1"));
        assert!(registry.latest("acme/app", "main").is_none());
        assert!(!registry.delete("img-1"));
    }

    #[test]
    fn list_is_sorted_by_built_at_descending() {
        let registry = ImageRegistry::default();
        registry.register(image("img-1", 1000));
        registry.register(image("img-3", 3000));
        registry.register(image("img-2", 2000));

        let listed = registry.list(&ImageQuery::default());
        let built: Vec<u64> = listed.iter().map(|i| i.built_at).collect();
        assert_eq!(built, vec![3000, 2000, 1000]);

        let limited = registry.list(&ImageQuery {
            limit: Some(1),
            offset: 1,
            ..Default::default()
        });
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].built_at, 2000);
    }

    #[test]
    fn retention_keeps_cap_and_never_latest() {
        let registry = ImageRegistry::new(RegistryConfig {
            max_images_per_branch: 2,
            max_image_age: Duration::from_secs(3600),
        });
        let now = now_ts();
        registry.register(image("img-old", now.saturating_sub(7200)));
        registry.register(image("img-a", now - 30));
        registry.register(image("img-b", now - 20));
        registry.register(image("img-c", now - 10));

        let deleted = registry.cleanup();
        // img-old: beyond cap AND past max age; img-a: beyond cap.
        assert!(deleted.contains(&"img-old".to_string()));
        assert!(deleted.contains(&"img-a".to_string()));
        assert!(registry.get("img-c").unwrap().is_latest);
        assert!(registry.get("img-b").is_some());
        assert_latest_unique(&registry, "acme/app", "main");
    }

    #[test]
    fn retention_spares_an_aged_latest() {
        let registry = ImageRegistry::new(RegistryConfig {
            max_images_per_branch: 5,
            max_image_age: Duration::from_secs(60),
        });
        let now = now_ts();
        registry.register(image("img-ancient", now.saturating_sub(86_400)));
        let deleted = registry.cleanup();
        assert!(deleted.is_empty(), "latest is never deleted by retention");
        assert!(registry.get("img-ancient").is_some());
    }
}
