use rustc_hash::FxHashMap;


/// What the authority advertises about a hosted module when a participant asks for it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ModuleSummary {
    pub name: String,
    pub file_count: u32,
    pub byte_size: u64,
}

/// Collaborator interface to the module/file-format loader: the session layer only needs
///  to look up what it would be replicating, never how it is parsed.
pub trait ModuleCatalog: Send + Sync + 'static {
    fn summary(&self, name: &str) -> Option<ModuleSummary>;
}

/// Catalog over a fixed set of summaries; enough for hosts that announce a single
///  module, and for tests.
pub struct StaticCatalog {
    modules: FxHashMap<String, ModuleSummary>,
}

impl StaticCatalog {
    pub fn new(modules: impl IntoIterator<Item = ModuleSummary>) -> StaticCatalog {
        StaticCatalog {
            modules: modules.into_iter()
                .map(|m| (m.name.clone(), m))
                .collect(),
        }
    }

    pub fn empty() -> StaticCatalog {
        StaticCatalog::new([])
    }
}

impl ModuleCatalog for StaticCatalog {
    fn summary(&self, name: &str) -> Option<ModuleSummary> {
        self.modules.get(name).cloned()
    }
}
