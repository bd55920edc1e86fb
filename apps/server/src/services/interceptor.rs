//! Interceptor hooks around persistence interactions
//!
//! Interceptors are called in registration order. A `before` hook that
//! returns an error vetoes the interaction; `after` errors fail it as well,
//! and the surrounding session is rolled back.

use crate::Result;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// What an interceptor sees of one interaction.
#[derive(Debug, Clone, Copy)]
pub struct InterceptorEvent<'a> {
    /// `create`, `update`, `patch`, `delete`, `read`, `vread`, `history`,
    /// `search` or `operation`.
    pub interaction: &'static str,
    pub resource_type: Option<&'a str>,
    pub id: Option<&'a str>,
    /// The resource about to be written, or the one just written/read.
    pub resource: Option<&'a JsonValue>,
    /// The current version an update, patch or delete replaces.
    pub prev_resource: Option<&'a JsonValue>,
}

impl<'a> InterceptorEvent<'a> {
    pub fn new(interaction: &'static str) -> Self {
        Self {
            interaction,
            resource_type: None,
            id: None,
            resource: None,
            prev_resource: None,
        }
    }

    pub fn target(mut self, resource_type: &'a str, id: Option<&'a str>) -> Self {
        self.resource_type = Some(resource_type);
        self.id = id;
        self
    }

    pub fn resource(mut self, resource: Option<&'a JsonValue>) -> Self {
        self.resource = resource;
        self
    }

    pub fn prev_resource(mut self, prev_resource: Option<&'a JsonValue>) -> Self {
        self.prev_resource = prev_resource;
        self
    }
}

#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn before(&self, _event: &InterceptorEvent<'_>) -> Result<()> {
        Ok(())
    }

    async fn after(&self, _event: &InterceptorEvent<'_>) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InterceptorManager {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, interceptor: Arc<dyn Interceptor>) {
        tracing::info!(interceptor = interceptor.name(), "Registered interceptor");
        self.interceptors.push(interceptor);
    }

    pub fn with(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.register(interceptor);
        self
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub async fn fire_before(&self, event: &InterceptorEvent<'_>) -> Result<()> {
        for interceptor in &self.interceptors {
            if let Err(err) = interceptor.before(event).await {
                tracing::debug!(
                    interceptor = interceptor.name(),
                    interaction = event.interaction,
                    error = %err,
                    "Interceptor rejected interaction"
                );
                return Err(err);
            }
        }
        Ok(())
    }

    pub async fn fire_after(&self, event: &InterceptorEvent<'_>) -> Result<()> {
        for interceptor in &self.interceptors {
            if let Err(err) = interceptor.after(event).await {
                tracing::warn!(
                    interceptor = interceptor.name(),
                    interaction = event.interaction,
                    error = %err,
                    "Interceptor failed after interaction"
                );
                return Err(err);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for InterceptorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.interceptors.iter().map(|i| i.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        veto: Option<&'static str>,
    }

    #[async_trait]
    impl Interceptor for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn before(&self, event: &InterceptorEvent<'_>) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:before:{}", self.name, event.interaction));
            match self.veto {
                Some(interaction) if interaction == event.interaction => {
                    Err(crate::Error::BusinessRule(format!("{} vetoed", self.name)))
                }
                _ => Ok(()),
            }
        }

        async fn after(&self, event: &InterceptorEvent<'_>) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:after:{}", self.name, event.interaction));
            Ok(())
        }
    }

    fn recorder(name: &str, log: &Arc<Mutex<Vec<String>>>, veto: Option<&'static str>) -> Arc<dyn Interceptor> {
        Arc::new(Recorder {
            name: name.to_string(),
            log: log.clone(),
            veto,
        })
    }

    #[tokio::test]
    async fn hooks_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = InterceptorManager::new()
            .with(recorder("a", &log, None))
            .with(recorder("b", &log, None));

        let event = InterceptorEvent::new("create").target("Patient", Some("1"));
        manager.fire_before(&event).await.unwrap();
        manager.fire_after(&event).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:before:create", "b:before:create", "a:after:create", "b:after:create"]
        );
    }

    #[tokio::test]
    async fn veto_stops_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = InterceptorManager::new()
            .with(recorder("guard", &log, Some("delete")))
            .with(recorder("audit", &log, None));

        let err = manager
            .fire_before(&InterceptorEvent::new("delete"))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::BusinessRule(_)));
        assert_eq!(*log.lock().unwrap(), vec!["guard:before:delete"]);
    }
}
