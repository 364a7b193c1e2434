use std::{collections::HashMap, sync::Arc};

use kiln_process::{ServerRecord, UpdateChannel};

use crate::{
    adapter::{GameVariant, ServerAdapter},
    config::AgentConfig,
    error::{Result, SupervisorError},
    hytale::HytaleServer,
    minecraft::MinecraftServer,
};

pub type VariantCtor = fn(ServerRecord, Arc<AgentConfig>) -> Box<dyn GameVariant>;

/// Game-type tag to variant constructor.
#[derive(Clone)]
pub struct AdapterFactory {
    ctors: HashMap<String, VariantCtor>,
}

impl Default for AdapterFactory {
    fn default() -> Self {
        let mut f = Self::empty();
        f.register("minecraft", |record, config| {
            let channel = record.channel;
            Box::new(MinecraftServer::new(record, channel, config))
        });
        f.register("paper", |record, config| {
            Box::new(MinecraftServer::new(record, UpdateChannel::Community, config))
        });
        f.register("hytale", |record, config| Box::new(HytaleServer::new(record, config)));
        f
    }
}

impl AdapterFactory {
    pub fn empty() -> Self {
        Self {
            ctors: HashMap::new(),
        }
    }

    /// Adds or replaces the constructor for `tag`.
    pub fn register(&mut self, tag: &str, ctor: VariantCtor) {
        self.ctors.insert(tag.trim().to_ascii_lowercase(), ctor);
    }

    pub fn supports(&self, tag: &str) -> bool {
        self.ctors.contains_key(&tag.trim().to_ascii_lowercase())
    }

    pub fn game_types(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.ctors.keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn create(&self, record: ServerRecord, config: Arc<AgentConfig>) -> Result<ServerAdapter> {
        let tag = record.game_type.trim().to_ascii_lowercase();
        let ctor = self
            .ctors
            .get(&tag)
            .ok_or_else(|| SupervisorError::UnknownGameType(record.game_type.clone()))?;
        let id = record.id.clone();
        let variant = ctor(record, config.clone());
        Ok(ServerAdapter::new(id, variant, config))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use kiln_process::ServerId;

    use super::*;

    fn record(game_type: &str) -> ServerRecord {
        ServerRecord {
            id: ServerId::from("s1"),
            game_type: game_type.to_string(),
            root_dir: PathBuf::from("/srv/s1"),
            port: 25565,
            memory_mb: 2048,
            channel: UpdateChannel::Official,
        }
    }

    fn config() -> Arc<AgentConfig> {
        let mut cfg = AgentConfig::default();
        cfg.console_log.enabled = false;
        Arc::new(cfg)
    }

    #[test]
    fn builtin_tags_are_registered() {
        let f = AdapterFactory::default();
        assert_eq!(f.game_types(), vec!["hytale", "minecraft", "paper"]);
        assert!(f.supports(" Minecraft "));
    }

    #[tokio::test]
    async fn creates_the_variant_for_the_tag() {
        let f = AdapterFactory::default();
        let paper = f.create(record("paper"), config()).unwrap();
        assert_eq!(paper.game_type(), "paper");
        assert_eq!(
            paper.update_target().unwrap().channel,
            UpdateChannel::Community
        );

        let hytale = f.create(record("HYTALE"), config()).unwrap();
        assert_eq!(hytale.game_type(), "hytale");
        assert!(hytale.update_target().is_none());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let f = AdapterFactory::default();
        let err = f.create(record("terraria"), config()).err().unwrap();
        assert!(matches!(err, SupervisorError::UnknownGameType(t) if t == "terraria"));
    }
}
