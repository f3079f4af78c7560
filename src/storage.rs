use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf};
use tokio::{fs, sync::Mutex};
use tracing::{debug, info, warn};

/// Ajustes de audio persistidos por servidor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildAudioSettings {
    pub guild_id: u64,
    /// Slider de volumen (0.0 - 1.0)
    pub volume: f32,
}

impl GuildAudioSettings {
    fn new(guild_id: u64, volume: f32) -> Self {
        Self { guild_id, volume }
    }
}

/// Manager de almacenamiento basado en archivos JSON
///
/// One file per guild under `<data_dir>/guilds/guild_<id>.json`, fronted by
/// an in-memory cache. [`JsonStorage::modify`] holds the store lock for the
/// whole read-modify-write, so concurrent updates to one guild never
/// interleave.
pub struct JsonStorage {
    data_dir: PathBuf,
    default_volume: f32,
    cache: Mutex<HashMap<u64, GuildAudioSettings>>,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf, default_volume: f32) -> Result<Self> {
        fs::create_dir_all(data_dir.join("guilds")).await?;
        info!("📁 Storage inicializado en: {}", data_dir.display());

        let storage = Self {
            data_dir,
            default_volume: default_volume.clamp(0.0, 1.0),
            cache: Mutex::new(HashMap::new()),
        };
        storage.load_all().await?;
        Ok(storage)
    }

    /// Obtiene los ajustes de un servidor (o los valores por defecto)
    pub async fn load(&self, guild_id: u64) -> Result<GuildAudioSettings> {
        let mut cache = self.cache.lock().await;
        Ok(self.cached(&mut cache, guild_id).await?.clone())
    }

    /// Applies `change` to the guild's settings and writes them back.
    ///
    /// Nothing is persisted if the write fails; the cache keeps the old value.
    pub async fn modify<R>(
        &self,
        guild_id: u64,
        change: impl FnOnce(&mut GuildAudioSettings) -> R,
    ) -> Result<R> {
        let mut cache = self.cache.lock().await;
        let mut settings = self.cached(&mut cache, guild_id).await?.clone();
        let result = change(&mut settings);

        self.save(&settings).await?;
        cache.insert(guild_id, settings);
        debug!("💾 Ajustes actualizados para guild {}", guild_id);
        Ok(result)
    }

    /// Elimina los ajustes guardados de un servidor
    pub async fn remove(&self, guild_id: u64) -> Result<bool> {
        let mut cache = self.cache.lock().await;
        cache.remove(&guild_id);
        match fs::remove_file(self.file_path(guild_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_guilds(&self) -> Vec<u64> {
        self.cache.lock().await.keys().copied().collect()
    }

    // Métodos privados

    async fn cached<'a>(
        &self,
        cache: &'a mut HashMap<u64, GuildAudioSettings>,
        guild_id: u64,
    ) -> Result<&'a GuildAudioSettings> {
        if !cache.contains_key(&guild_id) {
            let settings = match self.read_file(guild_id).await {
                Ok(settings) => settings,
                Err(e) => {
                    if self.file_path(guild_id).exists() {
                        warn!("⚠️ Ajustes ilegibles para guild {}, usando defaults: {}", guild_id, e);
                    }
                    GuildAudioSettings::new(guild_id, self.default_volume)
                }
            };
            cache.insert(guild_id, settings);
        }
        cache
            .get(&guild_id)
            .ok_or_else(|| anyhow::anyhow!("settings for guild {} vanished from cache", guild_id))
    }

    async fn read_file(&self, guild_id: u64) -> Result<GuildAudioSettings> {
        let content = fs::read_to_string(self.file_path(guild_id)).await?;
        let mut settings: GuildAudioSettings = serde_json::from_str(&content)?;
        settings.volume = settings.volume.clamp(0.0, 1.0);
        Ok(settings)
    }

    async fn save(&self, settings: &GuildAudioSettings) -> Result<()> {
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(self.file_path(settings.guild_id), content).await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<()> {
        let mut files = fs::read_dir(self.data_dir.join("guilds")).await?;
        let mut cache = self.cache.lock().await;

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Some(guild_id) = path
                .file_stem()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("guild_"))
                .and_then(|id| id.parse::<u64>().ok())
            else {
                continue;
            };

            match self.read_file(guild_id).await {
                Ok(settings) => {
                    cache.insert(guild_id, settings);
                }
                Err(e) => warn!("Error cargando ajustes para guild {}: {}", guild_id, e),
            }
        }

        if !cache.is_empty() {
            info!("📂 Cargados ajustes de {} servidores", cache.len());
        }
        Ok(())
    }

    fn file_path(&self, guild_id: u64) -> PathBuf {
        self.data_dir
            .join("guilds")
            .join(format!("guild_{}.json", guild_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn unknown_guild_gets_default_volume() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path().to_path_buf(), 0.7).await.unwrap();

        let settings = storage.load(42).await.unwrap();
        assert_eq!(settings, GuildAudioSettings::new(42, 0.7));
        // leer no escribe nada
        assert!(!dir.path().join("guilds/guild_42.json").exists());
    }

    #[tokio::test]
    async fn modify_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = JsonStorage::new(dir.path().to_path_buf(), 0.5).await.unwrap();
            let previous = storage
                .modify(7, |s| std::mem::replace(&mut s.volume, 0.25))
                .await
                .unwrap();
            assert_eq!(previous, 0.5);
        }

        let reopened = JsonStorage::new(dir.path().to_path_buf(), 0.5).await.unwrap();
        assert_eq!(reopened.list_guilds().await, vec![7]);
        assert_eq!(reopened.load(7).await.unwrap().volume, 0.25);

        assert!(reopened.remove(7).await.unwrap());
        assert!(!reopened.remove(7).await.unwrap());
        assert_eq!(reopened.load(7).await.unwrap().volume, 0.5);
    }

    #[tokio::test]
    async fn concurrent_modifications_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(JsonStorage::new(dir.path().to_path_buf(), 0.0).await.unwrap());

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let storage = storage.clone();
                tokio::spawn(async move { storage.modify(1, |s| s.volume += 0.01).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let volume = storage.load(1).await.unwrap().volume;
        assert!((volume - 0.1).abs() < 1e-5, "got {volume}");
    }

    #[tokio::test]
    async fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("guilds")).unwrap();
        std::fs::write(dir.path().join("guilds/guild_9.json"), "{ not json").unwrap();

        let storage = JsonStorage::new(dir.path().to_path_buf(), 0.4).await.unwrap();
        assert_eq!(storage.load(9).await.unwrap().volume, 0.4);
    }
}
