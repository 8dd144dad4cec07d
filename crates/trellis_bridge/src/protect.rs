use crate::error::BridgeResult;
use crate::value::ValueHandle;
use std::ops::Deref;

/// Holds one protection on a handle until dropped.
pub struct ProtectionGuard<'a> {
    handle: &'a ValueHandle,
}

impl<'a> ProtectionGuard<'a> {
    pub fn new(handle: &'a ValueHandle) -> BridgeResult<Self> {
        handle.protect()?;
        Ok(Self { handle })
    }
}

impl Deref for ProtectionGuard<'_> {
    type Target = ValueHandle;

    fn deref(&self) -> &ValueHandle {
        self.handle
    }
}

impl Drop for ProtectionGuard<'_> {
    fn drop(&mut self) {
        self.handle.unprotect();
    }
}

#[cfg(test)]
mod tests {
    use crate::context::Context;
    use crate::settings::BridgeSettings;

    #[test]
    fn test_guard_pairs_protection() {
        let context = Context::new(BridgeSettings::default()).unwrap();
        let object = context.object().unwrap();
        {
            let guard = object.guard().unwrap();
            assert_eq!(guard.protection_count(), 2);
        }
        assert_eq!(object.protection_count(), 1);
        context.dispose();
    }
}
