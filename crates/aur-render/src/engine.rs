//! Engine façade: scene manager plus the renderer set
//!
//! The engine owns the scene manager, the signal router, and every renderer.
//! Scene mutations run through `update_scene`, which derives a child from
//! the head snapshot, publishes it, and fans the new version out to all
//! renderers in registration order. In offline mode `process_block` drives
//! every renderer synchronously and mixes them into a master frame.

use std::sync::Arc;

use parking_lot::Mutex;

use aur_core::{
    AurResult, AuralizationMode, SampleFrame, SourceSignalBuffer, StreamInfo, StreamProperties,
};
use aur_scene::{SceneDraft, SceneManager, SceneRef};

use crate::{AudioRenderer, SignalRouter};

pub struct Engine {
    props: StreamProperties,
    scene_manager: SceneManager,
    signals: Arc<SignalRouter>,
    renderers: Mutex<Vec<Arc<dyn AudioRenderer>>>,
    stream_info: Mutex<StreamInfo>,
    master: Mutex<SampleFrame>,
    global_aura: Mutex<AuralizationMode>,
}

impl Engine {
    pub fn new(props: StreamProperties) -> Self {
        Self {
            props,
            scene_manager: SceneManager::new(),
            signals: SignalRouter::new(props.block_length),
            renderers: Mutex::new(Vec::new()),
            stream_info: Mutex::new(StreamInfo::default()),
            master: Mutex::new(SampleFrame::new(2, props.block_length)),
            global_aura: Mutex::new(AuralizationMode::default()),
        }
    }

    pub fn props(&self) -> StreamProperties {
        self.props
    }

    pub fn signals(&self) -> &Arc<SignalRouter> {
        &self.signals
    }

    pub fn scene_manager(&self) -> &SceneManager {
        &self.scene_manager
    }

    /// Register a renderer; it immediately receives the current global mode
    /// and, if one exists, the head scene
    pub fn add_renderer(&self, renderer: Arc<dyn AudioRenderer>) -> AurResult<()> {
        renderer.update_global_auralization_mode(*self.global_aura.lock());
        if let Some(scene) = self.scene_manager.head_scene_state() {
            renderer.update_scene(scene)?;
        }
        let channels = renderer.num_output_channels();
        let mut master = self.master.lock();
        if channels > master.num_channels() {
            master.reinit(channels, self.props.block_length);
        }
        self.renderers.lock().push(renderer);
        Ok(())
    }

    /// Mutate the scene and publish one new version to every renderer
    pub fn update_scene<F>(&self, modification_time: f64, mutate: F) -> AurResult<SceneRef>
    where
        F: FnOnce(&mut SceneDraft) -> AurResult<()>,
    {
        let mut draft = self.scene_manager.create_derived_head(modification_time)?;
        mutate(&mut draft)?;
        let scene = self.scene_manager.publish(draft);

        for renderer in self.renderers.lock().iter() {
            renderer.update_scene(scene.clone())?;
        }
        Ok(scene)
    }

    /// Rewrite the global auralization mode on every renderer
    pub fn set_global_auralization_mode(&self, mode: AuralizationMode) {
        *self.global_aura.lock() = mode;
        for renderer in self.renderers.lock().iter() {
            renderer.update_global_auralization_mode(mode);
        }
    }

    /// Input buffer of a source (creates one on first use)
    pub fn source_buffer(&self, source_id: i32) -> Arc<SourceSignalBuffer> {
        self.signals.buffer(source_id)
    }

    /// Reset every renderer (control thread)
    pub fn reset(&self) {
        for renderer in self.renderers.lock().iter() {
            renderer.reset();
        }
    }

    /// Drive one block through every renderer and mix into the master frame
    ///
    /// Offline-rendering entry point; with a real device callback the device
    /// loop calls the renderers directly instead.
    pub fn process_block(&self) -> StreamInfo {
        let info = *self.stream_info.lock();

        let mut master = self.master.lock();
        master.zero();
        for renderer in self.renderers.lock().iter() {
            renderer.process(&info);
            renderer.mix_output_into(&mut master);
        }
        drop(master);

        let mut stream_info = self.stream_info.lock();
        *stream_info = info.advanced(&self.props);
        info
    }

    /// Master output of the most recent block
    pub fn with_master<R>(&self, f: impl FnOnce(&SampleFrame) -> R) -> R {
        f(&self.master.lock())
    }

    pub fn current_stream_info(&self) -> StreamInfo {
        *self.stream_info.lock()
    }
}
