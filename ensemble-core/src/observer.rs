//! Named event handlers, invoked synchronously in registration order.

type Handler<T> = Box<dyn FnMut(&T) + Send>;

pub struct ObserverList<T> {
    handlers: Vec<(String, Handler<T>)>,
}

impl<T> Default for ObserverList<T> {
    fn default() -> Self {
        Self { handlers: Vec::new() }
    }
}

impl<T> ObserverList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`. A handler with the same name is replaced
    /// in place, keeping its position.
    pub fn add(&mut self, name: impl Into<String>, handler: impl FnMut(&T) + Send + 'static) {
        let name = name.into();
        match self.handlers.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = Box::new(handler),
            None => self.handlers.push((name, Box::new(handler))),
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(n, _)| n != name);
        self.handlers.len() != before
    }

    pub fn notify(&mut self, event: &T) {
        for (_, handler) in self.handlers.iter_mut() {
            handler(event);
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
