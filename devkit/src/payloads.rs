/*!
Builders de payloads de notification

Produit les documents JSON tels que publiés par le middleware sur le topic
de souscription, avec possibilité de retirer des champs pour les cas limites.
*/

use serde_json::{json, Map, Value};

/// Schéma d'archive embarqué, pour créer des archivers dans un dossier temporaire
pub const NOTIFICATION_SCHEMA: &str =
    include_str!("../../somiod-reactor/schemas/notification.schema.json");

/// Builder fluide d'une notification `{subscription_name, event_type, ...}`
#[derive(Debug, Clone)]
pub struct NotificationBuilder {
    fields: Map<String, Value>,
}

impl Default for NotificationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBuilder {
    pub fn new() -> Self {
        let mut fields = Map::new();
        fields.insert("subscription_name".into(), json!("sub-dash"));
        fields.insert("event_type".into(), json!("create"));
        fields.insert("resource_name".into(), json!("reading-1"));
        fields.insert("container_path".into(), json!("readings"));
        fields.insert(
            "timestamp".into(),
            json!(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()),
        );
        Self { fields }
    }

    pub fn subscription(self, name: &str) -> Self {
        self.field("subscription_name", json!(name))
    }

    pub fn event_type(self, event_type: &str) -> Self {
        self.field("event_type", json!(event_type))
    }

    pub fn resource(self, name: &str) -> Self {
        self.field("resource_name", json!(name))
    }

    pub fn container(self, path: &str) -> Self {
        self.field("container_path", json!(path))
    }

    pub fn timestamp(self, ts: &str) -> Self {
        self.field("timestamp", json!(ts))
    }

    /// Valeur arbitraire (y compris non-string) pour un champ
    pub fn field(mut self, name: &str, value: Value) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    /// Retire un champ du document
    pub fn without(mut self, name: &str) -> Self {
        self.fields.remove(name);
        self
    }

    pub fn build(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.build().to_string().into_bytes()
    }
}
