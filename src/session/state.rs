//! Owned native handles and the loaded/unloaded state machine.
//!
//! Each handle type frees its native resource in `Drop`, exactly once. They
//! hold the engine through an `Rc`, which keeps them `!Send`: a handle can
//! never leave the lane thread that created it.

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

use tracing::{debug, info};

use crate::engine::{ContextParams, Handle, NativeEngine};
use crate::session::SessionError;

pub(crate) struct ModelHandle<E: NativeEngine> {
    handle: Handle,
    engine: Rc<E>,
}

impl<E: NativeEngine> ModelHandle<E> {
    pub(crate) fn load(engine: &Rc<E>, path: &Path) -> Result<Self, SessionError> {
        let handle = Handle::from_raw(engine.load_model(path)).ok_or_else(|| {
            SessionError::ModelLoad {
                path: path.to_path_buf(),
            }
        })?;
        debug!(model = %handle, "Model handle acquired");
        Ok(Self {
            handle,
            engine: Rc::clone(engine),
        })
    }

    pub(crate) fn handle(&self) -> Handle {
        self.handle
    }
}

impl<E: NativeEngine> Drop for ModelHandle<E> {
    fn drop(&mut self) {
        debug!(model = %self.handle, "Freeing model");
        self.engine.free_model(self.handle);
    }
}

pub(crate) struct ContextHandle<E: NativeEngine> {
    handle: Handle,
    engine: Rc<E>,
}

impl<E: NativeEngine> ContextHandle<E> {
    /// Create a context bound to `model`. The borrow ties the context's
    /// creation to a live model; `LoadedModel` keeps the pair together after.
    pub(crate) fn create(
        engine: &Rc<E>,
        model: &ModelHandle<E>,
        params: &ContextParams,
        path: &Path,
    ) -> Result<Self, SessionError> {
        let handle = Handle::from_raw(engine.new_context(model.handle(), params)).ok_or_else(
            || SessionError::ContextCreate {
                path: path.to_path_buf(),
            },
        )?;
        debug!(context = %handle, model = %model.handle(), "Context handle acquired");
        Ok(Self {
            handle,
            engine: Rc::clone(engine),
        })
    }

    pub(crate) fn handle(&self) -> Handle {
        self.handle
    }
}

impl<E: NativeEngine> Drop for ContextHandle<E> {
    fn drop(&mut self) {
        debug!(context = %self.handle, "Freeing context");
        self.engine.free_context(self.handle);
    }
}

/// Per-operation scratch batch.
pub(crate) struct BatchHandle<E: NativeEngine> {
    handle: Handle,
    engine: Rc<E>,
}

impl<E: NativeEngine> BatchHandle<E> {
    pub(crate) fn allocate(engine: &Rc<E>, capacity: u32) -> Result<Self, SessionError> {
        let handle = Handle::from_raw(engine.new_batch(capacity, 0, 1))
            .ok_or(SessionError::BatchAlloc { capacity })?;
        Ok(Self {
            handle,
            engine: Rc::clone(engine),
        })
    }

    pub(crate) fn handle(&self) -> Handle {
        self.handle
    }
}

impl<E: NativeEngine> Drop for BatchHandle<E> {
    fn drop(&mut self) {
        self.engine.free_batch(self.handle);
    }
}

/// A model and the context created from it.
///
/// Field order is the teardown order: the context drops before the model.
pub(crate) struct LoadedModel<E: NativeEngine> {
    context: ContextHandle<E>,
    model: ModelHandle<E>,
    path: PathBuf,
}

impl<E: NativeEngine> LoadedModel<E> {
    pub(crate) fn context(&self) -> Handle {
        self.context.handle()
    }

    pub(crate) fn model(&self) -> Handle {
        self.model.handle()
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn release(self) {
        let LoadedModel {
            context,
            model,
            path,
        } = self;
        drop(context);
        drop(model);
        info!(path = %path.display(), "Unloaded model");
    }
}

pub(crate) enum SessionState<E: NativeEngine> {
    Unloaded,
    Loaded(LoadedModel<E>),
}

impl<E: NativeEngine> SessionState<E> {
    /// Replace whatever is loaded with the model at `path`.
    ///
    /// The previous model is released before the new one is created, so a
    /// failed load leaves the session `Unloaded`.
    pub(crate) fn load(
        &mut self,
        engine: &Rc<E>,
        path: &Path,
        params: &ContextParams,
    ) -> Result<(), SessionError> {
        self.unload();

        let start = Instant::now();
        info!(path = %path.display(), seed = params.seed, n_ctx = params.context_size, "Loading model");

        let model = ModelHandle::load(engine, path)?;
        // On failure `model` drops here, before the error reaches the caller.
        let context = ContextHandle::create(engine, &model, params, path)?;

        info!(
            path = %path.display(),
            model = %model.handle(),
            context = %context.handle(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Loaded model"
        );

        *self = SessionState::Loaded(LoadedModel {
            context,
            model,
            path: path.to_path_buf(),
        });
        Ok(())
    }

    /// Release the loaded model, if any. Returns whether anything was freed.
    pub(crate) fn unload(&mut self) -> bool {
        match std::mem::replace(self, SessionState::Unloaded) {
            SessionState::Loaded(loaded) => {
                loaded.release();
                true
            }
            SessionState::Unloaded => false,
        }
    }

    pub(crate) fn loaded(&self) -> Option<&LoadedModel<E>> {
        match self {
            SessionState::Loaded(loaded) => Some(loaded),
            SessionState::Unloaded => None,
        }
    }
}
