/*!
# SOMIOD DevKit - Stubs et utilitaires pour tester le pipeline

Bibliothèque facilitant les tests du reactor sans middleware ni broker:
- Stub du middleware SOMIOD (`ResourceStore` en mémoire)
- Builders de payloads de notification
- Harness complet archive + contrôle alimenté à la main
*/

pub mod middleware_stub;
pub mod payloads;
pub mod test_utils;

pub use middleware_stub::{CreatedInstance, MockMiddleware};
pub use payloads::{NotificationBuilder, NOTIFICATION_SCHEMA};
pub use test_utils::{HarnessBuilder, TestHarness};
