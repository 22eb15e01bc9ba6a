//! Provider registry and adapter factories.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use polyweave_common::{Error, Result};

use crate::adapter::BackendAdapter;
use crate::descriptor::{ConnectionConfig, ProviderDescriptor};

/// Lifecycle state of a registered provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    /// Registered, not yet connected.
    Registered,
    /// Connected and serving operations.
    Initialized,
    /// Connection failed; excluded from selection.
    Failed,
}

/// Optional restriction for [`ProviderRegistry::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderFilter {
    pub capabilities: Vec<String>,
    pub region: Option<String>,
}

impl ProviderFilter {
    fn matches(&self, descriptor: &ProviderDescriptor) -> bool {
        descriptor.has_capabilities(&self.capabilities)
            && self
                .region
                .as_deref()
                .map(|r| descriptor.serves_region(r))
                .unwrap_or(true)
    }
}

/// Outcome of [`ProviderRegistry::initialize_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    pub initialized: Vec<String>,
    /// Provider name and the connection error.
    pub failed: Vec<(String, String)>,
}

struct Entry {
    descriptor: ProviderDescriptor,
    adapter: Arc<dyn BackendAdapter>,
    connection: ConnectionConfig,
    state: ProviderState,
    last_error: Option<String>,
}

/// Registry of configured providers.
///
/// Sole owner of provider descriptors. Populated at startup and updated
/// administratively; readers never observe a partially applied change.
pub struct ProviderRegistry {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a provider.
    ///
    /// # Preconditions
    /// - `descriptor.name` must be unique within the registry
    ///
    /// # Errors
    /// - `Error::DuplicateProvider` if the name is already registered
    /// - `Error::Config` if the descriptor or connection is invalid
    pub fn register(
        &self,
        descriptor: ProviderDescriptor,
        adapter: Arc<dyn BackendAdapter>,
        connection: ConnectionConfig,
    ) -> Result<()> {
        descriptor.validate()?;
        connection.validate_for(descriptor.kind)?;

        let mut entries = self.entries.write();
        if entries.contains_key(&descriptor.name) {
            return Err(Error::DuplicateProvider(descriptor.name));
        }

        debug!(provider = %descriptor.name, kind = %descriptor.kind, "Registered provider");
        entries.insert(
            descriptor.name.clone(),
            Entry {
                descriptor,
                adapter,
                connection,
                state: ProviderState::Registered,
                last_error: None,
            },
        );
        Ok(())
    }

    /// Descriptor of a registered provider.
    ///
    /// # Errors
    /// - `Error::UnknownProvider` if absent
    pub fn get(&self, name: &str) -> Result<ProviderDescriptor> {
        self.entries
            .read()
            .get(name)
            .map(|e| e.descriptor.clone())
            .ok_or_else(|| Error::UnknownProvider(name.to_string()))
    }

    /// Adapter handle of a registered provider.
    pub fn adapter(&self, name: &str) -> Result<Arc<dyn BackendAdapter>> {
        self.entries
            .read()
            .get(name)
            .map(|e| Arc::clone(&e.adapter))
            .ok_or_else(|| Error::UnknownProvider(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Enabled descriptors matching the filter, ordered by name.
    pub fn list(&self, filter: Option<&ProviderFilter>) -> Vec<ProviderDescriptor> {
        self.entries
            .read()
            .values()
            .filter(|e| e.descriptor.enabled)
            .filter(|e| filter.map(|f| f.matches(&e.descriptor)).unwrap_or(true))
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Enabled descriptors with an established connection.
    pub fn list_available(&self) -> Vec<ProviderDescriptor> {
        self.entries
            .read()
            .values()
            .filter(|e| e.descriptor.enabled && e.state == ProviderState::Initialized)
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Every registered name, enabled or not.
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn state(&self, name: &str) -> Result<ProviderState> {
        self.entries
            .read()
            .get(name)
            .map(|e| e.state)
            .ok_or_else(|| Error::UnknownProvider(name.to_string()))
    }

    /// Last connection error of a provider, if any.
    pub fn last_error(&self, name: &str) -> Option<String> {
        self.entries
            .read()
            .get(name)
            .and_then(|e| e.last_error.clone())
    }

    /// Replace the descriptor of a registered provider.
    ///
    /// The adapter, connection and lifecycle state are kept.
    pub fn update(&self, descriptor: ProviderDescriptor) -> Result<()> {
        descriptor.validate()?;
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&descriptor.name)
            .ok_or_else(|| Error::UnknownProvider(descriptor.name.clone()))?;
        entry.connection.validate_for(descriptor.kind)?;

        info!(
            provider = %descriptor.name,
            enabled = descriptor.enabled,
            priority = descriptor.priority,
            "Updated provider"
        );
        entry.descriptor = descriptor;
        Ok(())
    }

    /// Connect every adapter that is not yet initialized.
    ///
    /// A failing provider is marked `Failed` and does not stop the others.
    pub async fn initialize_all(&self) -> InitReport {
        let pending: Vec<(String, Arc<dyn BackendAdapter>, ConnectionConfig)> = self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| e.state != ProviderState::Initialized)
            .map(|(name, e)| (name.clone(), Arc::clone(&e.adapter), e.connection.clone()))
            .collect();

        let mut report = InitReport::default();
        for (name, adapter, connection) in pending {
            let outcome = adapter.connect(&connection).await;
            self.record_connect(&name, connection.driver(), outcome, &mut report);
        }
        report
    }

    fn record_connect(&self, name: &str, driver: &str, outcome: Result<()>, report: &mut InitReport) {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(name) else {
            return;
        };
        match outcome {
            Ok(()) => {
                info!(provider = %name, driver, "Provider connected");
                entry.state = ProviderState::Initialized;
                entry.last_error = None;
                report.initialized.push(name.to_string());
            }
            Err(e) => {
                warn!(provider = %name, error = %e, "Provider failed to connect");
                entry.state = ProviderState::Failed;
                entry.last_error = Some(e.to_string());
                report.failed.push((name.to_string(), e.to_string()));
            }
        }
    }

    /// Disconnect every adapter.
    pub async fn shutdown(&self) {
        let adapters: Vec<(String, Arc<dyn BackendAdapter>)> = self
            .entries
            .read()
            .iter()
            .map(|(name, e)| (name.clone(), Arc::clone(&e.adapter)))
            .collect();

        for (name, adapter) in adapters {
            if let Err(e) = adapter.disconnect().await {
                warn!(provider = %name, error = %e, "Disconnect failed");
            }
            if let Some(entry) = self.entries.write().get_mut(&name) {
                entry.state = ProviderState::Registered;
            }
        }
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Factory function type for creating adapters.
pub type AdapterFactory =
    Box<dyn Fn(&ProviderDescriptor, &ConnectionConfig) -> Result<Arc<dyn BackendAdapter>> + Send + Sync>;

/// Adapter constructors keyed by driver name.
pub struct AdapterFactories {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterFactories {
    /// Create a new empty factory set.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Link a driver.
    ///
    /// # Errors
    /// - `Error::Config` if the driver is already linked
    pub fn register(&mut self, driver: impl Into<String>, factory: AdapterFactory) -> Result<()> {
        let driver = driver.into();
        if self.factories.contains_key(&driver) {
            return Err(Error::Config(format!(
                "driver '{}' is already linked",
                driver
            )));
        }
        self.factories.insert(driver, factory);
        Ok(())
    }

    /// Build the adapter for a provider.
    ///
    /// # Errors
    /// - `Error::Fatal` if no adapter is linked for the connection's driver
    pub fn create(
        &self,
        descriptor: &ProviderDescriptor,
        connection: &ConnectionConfig,
    ) -> Result<Arc<dyn BackendAdapter>> {
        let factory = self.factories.get(connection.driver()).ok_or_else(|| {
            Error::Fatal(format!(
                "adapter not linked for driver '{}' (provider '{}')",
                connection.driver(),
                descriptor.name
            ))
        })?;
        factory(descriptor, connection)
    }

    pub fn has_driver(&self, driver: &str) -> bool {
        self.factories.contains_key(driver)
    }

    pub fn drivers(&self) -> Vec<String> {
        let mut drivers: Vec<String> = self.factories.keys().cloned().collect();
        drivers.sort();
        drivers
    }
}

impl Default for AdapterFactories {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a factory set with the in-memory adapter linked.
pub fn create_default_factories() -> AdapterFactories {
    let mut factories = AdapterFactories::new();
    factories.factories.insert(
        "memory".to_string(),
        Box::new(|descriptor, _connection| {
            let adapter = crate::memory::MemoryAdapter::new(descriptor.name.clone())
                .with_capabilities(descriptor.capabilities.iter().cloned());
            Ok(Arc::new(adapter) as Arc<dyn BackendAdapter>)
        }),
    );
    factories
}
