//! Load lifecycle listeners.

use graphload_core::{Error, Identifier};

use crate::entity::{EntityRef, PropertyValue};

/// Fired before a hydrated entity receives its resolved state.
///
/// The loader reuses one event value for every entity of a load.
#[derive(Debug, Default)]
pub struct PreLoadEvent {
    pub entity: String,
    pub id: Option<Identifier>,
    pub state: Vec<PropertyValue>,
}

impl PreLoadEvent {
    pub fn reset(&mut self, entity: &str, id: &Identifier, state: Vec<PropertyValue>) {
        self.entity.clear();
        self.entity.push_str(entity);
        self.id = Some(id.clone());
        self.state = state;
    }
}

/// Fired once a loaded entity and everything loaded with it is complete.
#[derive(Debug, Default)]
pub struct PostLoadEvent {
    pub entity: String,
    pub instance: Option<EntityRef>,
}

impl PostLoadEvent {
    pub fn reset(&mut self, instance: &EntityRef) {
        self.entity = instance.entity_name();
        self.instance = Some(instance.clone());
    }
}

type PreLoadCallback = Box<dyn FnMut(&PreLoadEvent) -> Result<(), Error> + Send>;
type PostLoadCallback = Box<dyn FnMut(&PostLoadEvent) -> Result<(), Error> + Send>;

/// Registered load listeners; errors abort the load.
#[derive(Default)]
pub struct LoadEventListeners {
    pre_load: Vec<PreLoadCallback>,
    post_load: Vec<PostLoadCallback>,
}

impl std::fmt::Debug for LoadEventListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadEventListeners")
            .field("pre_load", &self.pre_load.len())
            .field("post_load", &self.post_load.len())
            .finish()
    }
}

impl LoadEventListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_pre_load(&mut self, f: impl FnMut(&PreLoadEvent) -> Result<(), Error> + Send + 'static) {
        self.pre_load.push(Box::new(f));
    }

    pub fn on_post_load(&mut self, f: impl FnMut(&PostLoadEvent) -> Result<(), Error> + Send + 'static) {
        self.post_load.push(Box::new(f));
    }

    #[allow(clippy::result_large_err)]
    pub fn fire_pre_load(&mut self, event: &PreLoadEvent) -> Result<(), Error> {
        for cb in &mut self.pre_load {
            cb(event)?;
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    pub fn fire_post_load(&mut self, event: &PostLoadEvent) -> Result<(), Error> {
        for cb in &mut self.post_load {
            cb(event)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.pre_load.is_empty() && self.post_load.is_empty()
    }
}
