use std::collections::HashMap;

use osd_protocol::{ModuleAddress, module::ModuleDescriptor};

use crate::{discovery::DegradedModule, error::ConnectError, error::NotFound};

/// The modules of a session.
///
/// Filled during discovery and sealed by [`Registry::finalize`]. A sealed registry is shared
/// read-only for the rest of the session.
#[derive(Debug, Default)]
pub struct Registry {
    modules: Vec<ModuleDescriptor>,
    index: HashMap<ModuleAddress, usize>,
    degraded: Vec<DegradedModule>,
    finalized: bool,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn register(&mut self, descriptor: ModuleDescriptor) -> Result<(), ConnectError> {
        let address = descriptor.address();
        if self.finalized {
            return Err(ConnectError::RegistrySealed(address));
        }
        if self.index.contains_key(&address) {
            return Err(ConnectError::DuplicateAddress(address));
        }
        log::debug!("Registered module {}", descriptor);
        self.index.insert(address, self.modules.len());
        self.modules.push(descriptor);
        Ok(())
    }

    /// Records a module that was expected but could not be described.
    pub fn record_degraded(&mut self, module: DegradedModule) -> Result<(), ConnectError> {
        if self.finalized {
            return Err(ConnectError::RegistrySealed(module.address));
        }
        self.degraded.push(module);
        Ok(())
    }

    pub fn lookup(&self, address: ModuleAddress) -> Result<&ModuleDescriptor, NotFound> {
        self.index
            .get(&address)
            .map(|&i| &self.modules[i])
            .ok_or(NotFound(address))
    }

    /// All registered modules in registration order
    pub fn all(&self) -> &[ModuleDescriptor] {
        &self.modules
    }

    pub fn degraded(&self) -> &[DegradedModule] {
        &self.degraded
    }

    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

#[cfg(test)]
mod test {
    use osd_protocol::module::ModuleType;

    use super::*;
    use crate::discovery::DegradeReason;

    #[test]
    fn lookup_registered_module() {
        let mut registry = Registry::new();
        let addr = ModuleAddress::new(0, 2);
        registry
            .register(ModuleDescriptor::standard(addr, ModuleType::Mam))
            .unwrap();
        assert_eq!(registry.lookup(addr).unwrap().address(), addr);
        assert_eq!(
            registry.lookup(ModuleAddress::new(0, 3)),
            Err(NotFound(ModuleAddress::new(0, 3)))
        );
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn duplicate_address_is_rejected() {
        let mut registry = Registry::new();
        let addr = ModuleAddress::new(0, 2);
        registry
            .register(ModuleDescriptor::standard(addr, ModuleType::Mam))
            .unwrap();
        assert!(matches!(
            registry.register(ModuleDescriptor::standard(addr, ModuleType::Stm)),
            Err(ConnectError::DuplicateAddress(a)) if a == addr
        ));
    }

    #[test]
    fn sealed_registry_is_read_only() {
        let mut registry = Registry::new();
        registry.finalize();
        assert!(registry.is_finalized());
        assert!(matches!(
            registry.register(ModuleDescriptor::standard(ModuleAddress::SCM, ModuleType::Scm)),
            Err(ConnectError::RegistrySealed(_))
        ));
        assert!(
            registry
                .record_degraded(DegradedModule {
                    address: ModuleAddress::new(0, 4),
                    attempts: 1,
                    reason: DegradeReason::NoResponse,
                })
                .is_err()
        );
    }
}
