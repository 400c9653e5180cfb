//! Renderer contract and shared construction parameters

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use aur_core::{AurResult, AuralizationMode, SampleFrame, SourceSignalBuffer, StreamInfo,
    StreamProperties, Struct};
use aur_scene::SceneRef;

/// The contract every renderer variant implements
///
/// `update_scene`, `reset`, and the parameter calls run on the control
/// thread; `process` runs under the audio deadline and must not block,
/// allocate, or take control-held locks.
pub trait AudioRenderer: Send + Sync {
    fn name(&self) -> &str;

    /// Absorb a newly published scene snapshot: diff against the current one,
    /// rebuild paths, feed motion keys, and queue an update message
    fn update_scene(&self, scene: SceneRef) -> AurResult<()>;

    /// Rewrite the global gate combined into every path's effective mode
    fn update_global_auralization_mode(&self, mode: AuralizationMode);

    /// Render one block into the internal output stream
    fn process(&self, info: &StreamInfo);

    /// Drain all live paths and entities, returning the renderer to its
    /// freshly-constructed state
    fn reset(&self);

    /// Mix the current output block into a destination frame
    fn mix_output_into(&self, dest: &mut SampleFrame);

    /// Output channel count of this renderer
    fn num_output_channels(&self) -> usize;

    /// Renderer-specific parameter side channel
    fn set_parameters(&self, params: &Struct) -> AurResult<()>;

    fn get_parameters(&self, query: &Struct) -> AurResult<Struct>;
}

/// Registry routing source ids to their input signal buffers
///
/// Signal generation is outside the engine core; whoever feeds the sources
/// registers a buffer per source id, and every renderer pulls from the same
/// buffer during its block.
pub struct SignalRouter {
    buffers: Mutex<HashMap<i32, Arc<SourceSignalBuffer>>>,
    block_length: usize,
}

impl SignalRouter {
    pub fn new(block_length: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: Mutex::new(HashMap::new()),
            block_length,
        })
    }

    /// Buffer for a source id, created on first use
    pub fn buffer(&self, source_id: i32) -> Arc<SourceSignalBuffer> {
        self.buffers
            .lock()
            .entry(source_id)
            .or_insert_with(|| SourceSignalBuffer::new(1, self.block_length))
            .clone()
    }

    pub fn remove(&self, source_id: i32) {
        self.buffers.lock().remove(&source_id);
    }
}

/// Construction parameters shared by all renderer variants
#[derive(Clone)]
pub struct RendererInitParams {
    /// Instance name, used for logging and motion log file prefixes
    pub name: String,
    pub props: StreamProperties,
    pub signals: Arc<SignalRouter>,
    /// Variant-specific configuration keys
    pub config: Struct,
    /// Without a real audio thread the control thread drives `process` and
    /// reset cleanup happens synchronously
    pub offline: bool,
}

impl RendererInitParams {
    pub fn new(name: impl Into<String>, props: StreamProperties, signals: Arc<SignalRouter>) -> Self {
        Self {
            name: name.into(),
            props,
            signals,
            config: Struct::new(),
            offline: false,
        }
    }

    pub fn with_config(mut self, config: Struct) -> Self {
        self.config = config;
        self
    }

    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }
}

/// Convenience: drive a renderer for `blocks` blocks in offline mode
pub fn run_blocks(renderer: &dyn AudioRenderer, info: &mut StreamInfo, props: &StreamProperties, blocks: usize) {
    for _ in 0..blocks {
        renderer.process(info);
        *info = info.advanced(props);
    }
}
