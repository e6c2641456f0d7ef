//! Screen capture via PipeWire. PipeWire's Rust bindings are built on `Rc`
//! and are not `Send`, so (mirroring the dedicated-thread architecture every
//! PipeWire-backed Rust capture library in this space uses) the entire
//! `MainLoop`/`Context`/`Stream` graph is built and driven on one thread that
//! this backend owns exclusively; `stop_capture` signals it to quit via a
//! `pipewire::channel` rather than touching PipeWire state from the caller's
//! thread.
//!
//! This backend does not itself perform the xdg-desktop-portal ScreenCast
//! handshake: the target's `DeviceId` is expected to already be a PipeWire
//! node id handed out by a portal session obtained elsewhere (the portal
//! conversation is a D-Bus concern, not a capture-core one). `DisplayId`
//! targets are rejected with `InvalidArgument` for the same reason sessions
//! cannot be resolved from a bare display index without the portal.

use std::io::Cursor;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use libspa::param::format::{MediaSubtype, MediaType};
use libspa::param::format_utils;
use libspa::param::video::VideoFormat as SpaVideoFormat;
use libspa::pod::serialize::PodSerializer;
use libspa::pod::{self, Pod};
use libspa::utils::{Direction as SpaDirection, Fraction, Rectangle};
use parking_lot::Mutex;
use pipewire as pw;
use pw::properties::properties;
use pw::stream::StreamFlags;

use common::Size;

use crate::envelope::{
    BufferEnvelope, ContentType, EnvelopeBody, EnvelopeKind, ReleasableResource, ReleaseArena,
    VideoSubRecord,
};
use crate::error::{MiniavError, Result};
use crate::format::{plane_layout, ConfiguredFormat, OutputPreference, PixelFormat, VideoFormat};
use crate::producer::timestamp_us;
use crate::source::DeviceDescriptor;
use crate::target::TargetDescriptor;
use crate::vtable::{CaptureBackend, ConfigureRequest, FrameCallback};

struct HeapCopyResource {
    _bytes: Vec<u8>,
}

impl ReleasableResource for HeapCopyResource {
    fn release(self: Box<Self>) {}
}

enum Terminate {
    Stop,
}

fn build_format_params(size: Size) -> Result<Vec<u8>> {
    let object = pod::object!(
        libspa::utils::SpaTypes::ObjectParamFormat,
        libspa::param::ParamType::EnumFormat,
        pod::property!(libspa::param::format::FormatProperties::MediaType, Id, MediaType::Video),
        pod::property!(libspa::param::format::FormatProperties::MediaSubtype, Id, MediaSubtype::Raw),
        pod::property!(libspa::param::format::FormatProperties::VideoFormat, Id, SpaVideoFormat::BGRx),
        pod::property!(
            libspa::param::format::FormatProperties::VideoSize,
            Choice, Range, Rectangle,
            Rectangle { width: size.width.max(1), height: size.height.max(1) },
            Rectangle { width: 1, height: 1 },
            Rectangle { width: 8192, height: 4320 }
        ),
        pod::property!(
            libspa::param::format::FormatProperties::VideoFramerate,
            Choice, Range, Fraction,
            Fraction { num: 60, denom: 1 },
            Fraction { num: 0, denom: 1 },
            Fraction { num: 1000, denom: 1 }
        ),
    );

    PodSerializer::serialize(Cursor::new(Vec::new()), &pod::Value::Object(object))
        .map(|(cursor, _)| cursor.into_inner())
        .map_err(|e| MiniavError::SystemCallFailed(format!("spa pod serialize: {e:?}")))
}

pub struct ScreenBackend {
    node_id: Option<u32>,
    format: Option<VideoFormat>,
    terminate_tx: Option<pw::channel::Sender<Terminate>>,
    thread: Option<JoinHandle<()>>,
}

impl ScreenBackend {
    pub fn new() -> Self {
        Self {
            node_id: None,
            format: None,
            terminate_tx: None,
            thread: None,
        }
    }
}

impl Default for ScreenBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for ScreenBackend {
    fn name(&self) -> &'static str {
        "pipewire-screen"
    }

    fn probe(&self) -> bool {
        pw::main_loop::MainLoop::new(None)
            .and_then(|main_loop| pw::context::Context::new(&main_loop).ok())
            .is_some()
    }

    fn init(&mut self) -> Result<()> {
        pw::init();
        Ok(())
    }

    fn destroy(&mut self) {
        if let Some(tx) = self.terminate_tx.take() {
            let _ = tx.send(Terminate::Stop);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let main_loop = pw::main_loop::MainLoop::new(None)
            .map_err(|e| MiniavError::from_native("pw_main_loop_new", e))?;
        let context =
            pw::context::Context::new(&main_loop).map_err(|e| MiniavError::from_native("pw_context_new", e))?;
        let core = context.connect(None).map_err(|e| MiniavError::from_native("pw_context_connect", e))?;
        let registry = core.get_registry().map_err(|e| MiniavError::from_native("pw_core_get_registry", e))?;

        let found = Arc::new(Mutex::new(Vec::new()));
        let found_cb = found.clone();
        let _listener = registry
            .add_listener_local()
            .global(move |global| {
                let Some(props) = global.props else { return };
                let Some(class) = props.get("media.class") else { return };
                if class != "Video/Source" && class != "Stream/Output/Video" {
                    return;
                }
                let name = props
                    .get("node.description")
                    .or_else(|| props.get("node.name"))
                    .unwrap_or("PipeWire video source")
                    .to_string();
                found_cb.lock().push(DeviceDescriptor::new(global.id.to_string(), name));
            })
            .register();

        let deadline = Duration::from_millis(300);
        let mut waited = Duration::ZERO;
        let step = Duration::from_millis(20);
        while waited < deadline {
            main_loop.loop_().iterate(step);
            waited += step;
        }

        Ok(found.lock().clone())
    }

    fn get_supported_formats(&self, _device_id: &str) -> Result<Vec<ConfiguredFormat>> {
        Err(MiniavError::NotImplemented("pipewire negotiates format against the node's SPA_PARAM_EnumFormat list"))
    }

    fn get_default_format(&self, _device_id: &str) -> Result<ConfiguredFormat> {
        Ok(ConfiguredFormat::Video(VideoFormat {
            size: Size { width: 1920, height: 1080 },
            pixel_format: PixelFormat::Bgra32,
            frame_rate_num: 60,
            frame_rate_den: 1,
            output_preference: OutputPreference::Cpu,
        }))
    }

    fn configure(&mut self, request: &ConfigureRequest) -> Result<()> {
        if self.thread.is_some() {
            return Err(MiniavError::InvalidOperation("cannot configure while running"));
        }

        let ConfiguredFormat::Video(format) = request.format else {
            return Err(MiniavError::FormatNotSupported);
        };

        let node_id = match &request.target {
            Some(TargetDescriptor::DeviceId(id)) => id
                .parse::<u32>()
                .map_err(|_| MiniavError::InvalidArgument("screen target must be a PipeWire node id".into()))?,
            Some(TargetDescriptor::DisplayId(_)) | None => {
                return Err(MiniavError::InvalidArgument(
                    "pipewire screen capture requires a node id obtained from a portal session".into(),
                ))
            }
            Some(_) => return Err(MiniavError::InvalidArgument("unsupported screen target".into())),
        };

        self.node_id = Some(node_id);
        self.format = Some(format);
        Ok(())
    }

    fn start_capture(
        &mut self,
        arena: Arc<Mutex<ReleaseArena>>,
        callback: FrameCallback,
        user_data: usize,
    ) -> Result<()> {
        let node_id = self.node_id.ok_or(MiniavError::NotInitialized)?;
        let format = self.format.ok_or(MiniavError::NotInitialized)?;

        let (terminate_tx, terminate_rx) = pw::channel::channel::<Terminate>();

        let thread = std::thread::Builder::new()
            .name("miniav-screen-pipewire".into())
            .spawn(move || run_stream_loop(node_id, format, arena, callback, user_data, terminate_rx))
            .map_err(|e| MiniavError::SystemCallFailed(e.to_string()))?;

        self.terminate_tx = Some(terminate_tx);
        self.thread = Some(thread);
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<()> {
        if let Some(tx) = self.terminate_tx.take() {
            let _ = tx.send(Terminate::Stop);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        Ok(())
    }

    fn get_configured_format(&self) -> Result<ConfiguredFormat> {
        self.format.map(ConfiguredFormat::Video).ok_or(MiniavError::NotInitialized)
    }
}

fn run_stream_loop(
    node_id: u32,
    format: VideoFormat,
    arena: Arc<Mutex<ReleaseArena>>,
    callback: FrameCallback,
    user_data: usize,
    terminate_rx: pw::channel::Receiver<Terminate>,
) {
    pw::init();

    let main_loop = match pw::main_loop::MainLoop::new(None) {
        Ok(main_loop) => main_loop,
        Err(err) => {
            log::error!("pipewire screen: pw_main_loop_new failed: {err}");
            return;
        }
    };

    let _receiver = {
        let weak = main_loop.downgrade();
        terminate_rx.attach(main_loop.loop_(), move |Terminate::Stop| {
            if let Some(main_loop) = weak.upgrade() {
                main_loop.quit();
            }
        })
    };

    let context = match pw::context::Context::new(&main_loop) {
        Ok(context) => context,
        Err(err) => {
            log::error!("pipewire screen: pw_context_new failed: {err}");
            return;
        }
    };
    let core = match context.connect(None) {
        Ok(core) => core,
        Err(err) => {
            log::error!("pipewire screen: pw_context_connect failed: {err}");
            return;
        }
    };

    let stream = match pw::stream::Stream::new(
        &core,
        "miniav-screen",
        properties! {
            *pw::keys::MEDIA_TYPE => "Video",
            *pw::keys::MEDIA_CATEGORY => "Capture",
            *pw::keys::MEDIA_ROLE => "Screen",
        },
    ) {
        Ok(stream) => stream,
        Err(err) => {
            log::error!("pipewire screen: pw_stream_new failed: {err}");
            return;
        }
    };

    let stride = format.size.width as usize * 4;

    let _listener = stream
        .add_local_listener_with_user_data(())
        .param_changed(move |_, _, id, param| {
            let Some(param) = param else { return };
            if id != libspa::param::ParamType::Format.as_raw() {
                return;
            }
            let _ = format_utils::parse_format(param);
        })
        .process(move |stream, _| {
            let Some(mut buffer) = stream.dequeue_buffer() else { return };
            let datas = buffer.datas_mut();
            let Some(data) = datas.get_mut(0) else { return };
            let chunk_size = data.chunk().size() as usize;
            let Some(slice) = data.data() else { return };
            let size = chunk_size.min(slice.len());
            if size == 0 {
                return;
            }

            let bytes = slice[..size].to_vec();
            let data_ptr = bytes.as_ptr() as usize;
            let data_size_bytes = bytes.len();
            let planes = plane_layout(format.pixel_format, format.size, stride);

            let token = arena.lock().insert(Box::new(HeapCopyResource { _bytes: bytes }));

            callback(BufferEnvelope {
                kind: EnvelopeKind::Video,
                content_type: ContentType::Cpu,
                timestamp_us: timestamp_us(),
                body: EnvelopeBody::Video(VideoSubRecord { format, planes, data_ptr }),
                data_size_bytes,
                user_data,
                release_token: token,
            });
        })
        .register();

    let format_bytes = match build_format_params(format.size) {
        Ok(bytes) => bytes,
        Err(err) => {
            log::error!("pipewire screen: {err}");
            return;
        }
    };
    let Some(format_pod) = Pod::from_bytes(&format_bytes) else {
        log::error!("pipewire screen: failed to build format pod");
        return;
    };
    let mut params = [format_pod];

    if let Err(err) = stream.connect(
        SpaDirection::Input,
        Some(node_id),
        StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS,
        &mut params,
    ) {
        log::error!("pipewire screen: pw_stream_connect failed: {err}");
        return;
    }

    main_loop.run();
}

pub fn descriptor() -> crate::registry::BackendDescriptor {
    crate::registry::BackendDescriptor {
        name: "pipewire-screen",
        factory: Box::new(|| Box::new(ScreenBackend::new())),
    }
}
