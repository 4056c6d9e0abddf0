// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 pdds contributors

//! Transport factory: plugin type registration and instance lifecycle.
//!
//! The factory is the single entry point of the transport layer. Plugin
//! types register a generator closure under a type name; the upper layers
//! then create named [`crate::TransportInstance`]s from those types, look
//! them up, and release them. One shared [`crate::cleanup::DataLinkCleanupTask`]
//! serves every instance the factory creates.
//!
//! The registry lock is never held across plugin code (generators,
//! `configure`, `shutdown`), so a slow plugin cannot stall unrelated
//! factory calls.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cleanup::{CleanupHandle, DataLinkCleanupTask};
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::instance::{Transport, TransportInstance};

/// Produces a fresh plugin for each instance of a registered type.
pub type TransportGenerator = Arc<dyn Fn() -> Box<dyn Transport> + Send + Sync>;

#[derive(Default)]
struct Registry {
    generators: HashMap<String, TransportGenerator>,
    instances: HashMap<String, Arc<TransportInstance>>,
}

/// Registry of transport types and the instances created from them.
pub struct TransportFactory {
    registry: Mutex<Registry>,
    cleanup_task: Mutex<Option<DataLinkCleanupTask>>,
    cleanup: CleanupHandle,
}

impl TransportFactory {
    /// Create a factory and its shared cleanup worker.
    pub fn new() -> Result<Self> {
        let task = DataLinkCleanupTask::spawn()?;
        let cleanup = task.handle();
        Ok(Self {
            registry: Mutex::new(Registry::default()),
            cleanup_task: Mutex::new(Some(task)),
            cleanup,
        })
    }

    // ========================================================================
    // Type registration
    // ========================================================================

    /// Register a transport type under `type_name`.
    ///
    /// Re-registering an existing name fails and keeps the original
    /// generator, so instances created earlier keep meaning what they meant.
    pub fn register_type(&self, type_name: &str, generator: TransportGenerator) -> Result<()> {
        let mut registry = self.registry.lock();
        if registry.generators.contains_key(type_name) {
            log::warn!("[FACTORY] type '{}' already registered", type_name);
            return Err(TransportError::DuplicateType(type_name.to_string()));
        }
        registry.generators.insert(type_name.to_string(), generator);
        log::info!("[FACTORY] registered transport type '{}'", type_name);
        Ok(())
    }

    /// Whether a type name is registered.
    pub fn has_type(&self, type_name: &str) -> bool {
        self.registry.lock().generators.contains_key(type_name)
    }

    // ========================================================================
    // Instance lifecycle
    // ========================================================================

    /// Create an instance named `id` from the registered type `type_name`,
    /// optionally configuring it in the same call.
    ///
    /// Fails without side effects when `id` is taken or `type_name` is
    /// unknown. The registry lock is dropped while the generator and
    /// `configure` run; if another creation for the same id wins that race,
    /// the loser is shut down and `DuplicateId` is returned.
    pub fn create(
        &self,
        id: &str,
        type_name: &str,
        config: Option<Arc<dyn TransportConfig>>,
    ) -> Result<Arc<TransportInstance>> {
        let generator = {
            let registry = self.registry.lock();
            if registry.instances.contains_key(id) {
                return Err(TransportError::DuplicateId(id.to_string()));
            }
            registry
                .generators
                .get(type_name)
                .cloned()
                .ok_or_else(|| TransportError::UnknownType(type_name.to_string()))?
        };

        let instance = TransportInstance::new(id, generator(), self.cleanup.clone());
        if let Some(config) = config {
            if let Err(e) = instance.configure(config) {
                instance.shutdown();
                return Err(e);
            }
        }

        let mut registry = self.registry.lock();
        if registry.instances.contains_key(id) {
            drop(registry);
            log::warn!("[FACTORY] concurrent create for '{}' lost the race", id);
            instance.shutdown();
            return Err(TransportError::DuplicateId(id.to_string()));
        }
        registry.instances.insert(id.to_string(), instance.clone());
        log::info!("[FACTORY] created instance '{}' of type '{}'", id, type_name);
        Ok(instance)
    }

    /// Look up a live instance by id.
    pub fn obtain(&self, id: &str) -> Result<Arc<TransportInstance>> {
        self.registry
            .lock()
            .instances
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(id.to_string()))
    }

    /// Remove an instance from the registry and shut it down.
    ///
    /// Outstanding `Arc`s held by callers stay valid but inert.
    pub fn release(&self, id: &str) -> Result<()> {
        let instance = self
            .registry
            .lock()
            .instances
            .remove(id)
            .ok_or_else(|| TransportError::NotFound(id.to_string()))?;
        instance.shutdown();
        log::info!("[FACTORY] released instance '{}'", id);
        Ok(())
    }

    /// Shut down and remove every instance. Idempotent.
    pub fn release_all(&self) {
        let drained: Vec<Arc<TransportInstance>> = {
            let mut registry = self.registry.lock();
            registry.instances.drain().map(|(_, v)| v).collect()
        };
        for instance in drained {
            instance.shutdown();
        }
    }

    /// Number of live instances.
    pub fn instance_count(&self) -> usize {
        self.registry.lock().instances.len()
    }
}

impl Drop for TransportFactory {
    fn drop(&mut self) {
        self.release_all();
        // Join the cleanup worker after the instances have queued their
        // final teardown work
        if let Some(mut task) = self.cleanup_task.lock().take() {
            task.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{association_to, MockConfig, MockTransport};
    use crate::types::{Direction, LinkQos};

    fn mock_generator(kind: u32) -> TransportGenerator {
        Arc::new(move || Box::new(MockTransport::new(kind)))
    }

    #[test]
    fn test_register_and_create() {
        let factory = TransportFactory::new().unwrap();
        factory.register_type("mock", mock_generator(1)).unwrap();
        assert!(factory.has_type("mock"));

        let instance = factory.create("net0", "mock", None).unwrap();
        assert_eq!(instance.id(), "net0");
        assert_eq!(instance.kind(), 1);
        assert!(Arc::ptr_eq(&instance, &factory.obtain("net0").unwrap()));
    }

    #[test]
    fn test_duplicate_type_keeps_original() {
        let factory = TransportFactory::new().unwrap();
        factory.register_type("mock", mock_generator(1)).unwrap();
        let err = factory.register_type("mock", mock_generator(2)).unwrap_err();
        assert!(matches!(err, TransportError::DuplicateType(_)));

        // Instances still come from the first registration
        let instance = factory.create("net0", "mock", None).unwrap();
        assert_eq!(instance.kind(), 1);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let factory = TransportFactory::new().unwrap();
        assert!(matches!(
            factory.create("net0", "missing", None),
            Err(TransportError::UnknownType(_))
        ));
    }

    #[test]
    fn test_duplicate_id_leaves_first_instance_untouched() {
        let factory = TransportFactory::new().unwrap();
        factory.register_type("mock", mock_generator(1)).unwrap();

        let first = factory.create("net0", "mock", None).unwrap();
        let err = factory.create("net0", "mock", None).unwrap_err();
        assert!(matches!(err, TransportError::DuplicateId(_)));

        // First instance still live and reachable
        assert!(Arc::ptr_eq(&first, &factory.obtain("net0").unwrap()));
        first
            .reserve_datalink(
                &association_to(1, "10.1.0.1:7400", Direction::Active),
                &LinkQos::default(),
            )
            .unwrap();
    }

    #[test]
    fn test_create_with_config() {
        let factory = TransportFactory::new().unwrap();
        factory.register_type("mock", mock_generator(1)).unwrap();

        let instance = factory
            .create("net0", "mock", Some(Arc::new(MockConfig::default())))
            .unwrap();
        assert!(instance.connection_info().is_ok());
    }

    #[test]
    fn test_failed_configure_registers_nothing() {
        use crate::config::CommonConfig;

        let factory = TransportFactory::new().unwrap();
        factory.register_type("mock", mock_generator(1)).unwrap();

        let bad = MockConfig {
            common: CommonConfig {
                recv_buffer_size: 0,
                ..Default::default()
            },
        };
        assert!(factory.create("net0", "mock", Some(Arc::new(bad))).is_err());
        assert!(matches!(
            factory.obtain("net0"),
            Err(TransportError::NotFound(_))
        ));
        // The id stays available
        factory.create("net0", "mock", None).unwrap();
    }

    #[test]
    fn test_release_and_release_all() {
        let factory = TransportFactory::new().unwrap();
        factory.register_type("mock", mock_generator(1)).unwrap();

        factory.create("net0", "mock", None).unwrap();
        factory.create("net1", "mock", None).unwrap();
        assert_eq!(factory.instance_count(), 2);

        factory.release("net0").unwrap();
        assert!(matches!(
            factory.release("net0"),
            Err(TransportError::NotFound(_))
        ));
        assert_eq!(factory.instance_count(), 1);

        factory.release_all();
        factory.release_all();
        assert_eq!(factory.instance_count(), 0);
    }

    #[test]
    fn test_released_instance_handle_is_inert() {
        let factory = TransportFactory::new().unwrap();
        factory.register_type("mock", mock_generator(1)).unwrap();

        let instance = factory.create("net0", "mock", None).unwrap();
        factory.release("net0").unwrap();

        assert!(matches!(
            instance.reserve_datalink(
                &association_to(1, "10.1.0.2:7400", Direction::Active),
                &LinkQos::default(),
            ),
            Err(TransportError::Shutdown)
        ));
    }
}
