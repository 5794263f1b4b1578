//! Simulated Scanner Devices
//!
//! TCP clients that behave like the turntable and camera controllers: they
//! connect to a running link, retry every second while the link is not
//! there, and answer requests the way the device firmware does.
//!
//! # Behaviour
//!
//! - `SimulatedPositioner`: `0x0A` is answered with `0xAA` after a delay
//!   proportional to the travelled angle; `0x0F` is answered with `0xAF`
//! - `SimulatedCamera`: `0x1B` is answered with `0xBB` followed by a 16-bit
//!   little-endian ramp image after a fixed delay
//!
//! Requests are served one at a time, in arrival order.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::AppResult;
use crate::network::protocol::{self, CaptureMessage, PositionerMessage, FRAME_SIZE};

/// Delay between connection attempts.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

enum Exit {
    Shutdown,
    Closed,
}

/// Handle to a running simulated device.
///
/// Dropping the handle detaches the device; it keeps running until the
/// runtime shuts down. Use [`SimHandle::shutdown`] to disconnect it.
pub struct SimHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SimHandle {
    /// Disconnects the device and waits for its task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(device = self.name, error = %e, "Simulator task failed");
        }
    }

    /// True once the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Resolves once `shutdown` is explicitly requested. A dropped sender never
/// resolves it.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let requested = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !requested {
        std::future::pending::<()>().await;
    }
}

/// Connects to `addr` forever, handing every established stream to `serve`.
async fn connect_loop<F, Fut>(addr: SocketAddr, mut shutdown: watch::Receiver<bool>, mut serve: F)
where
    F: FnMut(TcpStream, watch::Receiver<bool>) -> Fut,
    Fut: std::future::Future<Output = Exit>,
{
    loop {
        let connected = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => return,
            connected = TcpStream::connect(addr) => connected,
        };

        match connected {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "Could not disable Nagle");
                }
                info!(%addr, "Connected");
                match serve(stream, shutdown.clone()).await {
                    Exit::Shutdown => return,
                    Exit::Closed => info!(%addr, "Connection closed"),
                }
            }
            Err(e) => debug!(%addr, error = %e, "Connect failed, retrying"),
        }

        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => return,
            _ = sleep(RECONNECT_INTERVAL) => {}
        }
    }
}

/// Reads one frame, or reports why the connection ended.
async fn next_frame(
    stream: &mut TcpStream,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<protocol::Frame>, Exit> {
    let mut buf = [0u8; FRAME_SIZE];
    tokio::select! {
        _ = shutdown_requested(shutdown) => Err(Exit::Shutdown),
        read = stream.read_exact(&mut buf) => match read {
            Ok(_) => match protocol::decode(&buf) {
                Ok(frame) => Ok(Some(frame)),
                Err(e) => {
                    warn!(error = %e, "Ignoring frame");
                    Ok(None)
                }
            },
            Err(_) => Err(Exit::Closed),
        }
    }
}

async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> Result<(), Exit> {
    tokio::select! {
        _ = shutdown_requested(shutdown) => Err(Exit::Shutdown),
        _ = sleep(duration) => Ok(()),
    }
}

async fn send(stream: &mut TcpStream, bytes: &[u8]) -> Result<(), Exit> {
    stream.write_all(bytes).await.map_err(|e| {
        warn!(error = %e, "Send failed");
        Exit::Closed
    })
}

// =============================================================================
// SimulatedPositioner
// =============================================================================

/// Simulated turntable controller.
#[derive(Clone)]
pub struct SimulatedPositioner {
    addr: SocketAddr,
    speed_deg_per_sec: f64,
    angle: Arc<Mutex<f64>>,
}

impl SimulatedPositioner {
    /// Creates a positioner at 0° that will connect to `addr`, moving at 90°/s.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            speed_deg_per_sec: 90.0,
            angle: Arc::new(Mutex::new(0.0)),
        }
    }

    /// Sets the rotation speed. Non-positive speeds make moves instantaneous.
    pub fn with_speed(mut self, deg_per_sec: f64) -> Self {
        self.speed_deg_per_sec = deg_per_sec;
        self
    }

    /// Current simulated angle in degrees.
    pub fn angle(&self) -> f64 {
        *self.angle.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_angle(&self, angle: f64) {
        *self.angle.lock().unwrap_or_else(|p| p.into_inner()) = angle;
    }

    fn travel_time(&self, target: f64) -> Duration {
        if self.speed_deg_per_sec <= 0.0 {
            return Duration::ZERO;
        }
        let seconds = (target - self.angle()).abs() / self.speed_deg_per_sec;
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO)
    }

    /// Starts the connect/serve loop on the current runtime.
    pub fn spawn(&self) -> SimHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let device = self.clone();
        let task = tokio::spawn(
            async move {
                let addr = device.addr;
                connect_loop(addr, shutdown_rx, |stream, rx| {
                    let device = device.clone();
                    async move { device.serve(stream, rx).await }
                })
                .await
            }
            .instrument(info_span!("sim_positioner")),
        );
        SimHandle {
            name: "positioner",
            shutdown,
            task,
        }
    }

    async fn serve(&self, mut stream: TcpStream, mut shutdown: watch::Receiver<bool>) -> Exit {
        loop {
            let frame = match next_frame(&mut stream, &mut shutdown).await {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(exit) => return exit,
            };
            if let Err(exit) = self.handle(&mut stream, &frame, &mut shutdown).await {
                return exit;
            }
        }
    }

    async fn handle(
        &self,
        stream: &mut TcpStream,
        frame: &protocol::Frame,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), Exit> {
        match PositionerMessage::from_frame(frame) {
            Some(PositionerMessage::MoveTo { token, angle }) => {
                debug!(%token, angle, "Moving");
                pause(self.travel_time(angle), shutdown).await?;
                self.set_angle(angle);
                let reply = encode_or_close(PositionerMessage::MoveDone { token, angle }.encode())?;
                send(stream, &reply).await
            }
            Some(PositionerMessage::RequestStatus) => {
                let reply = encode_or_close(
                    PositionerMessage::Status {
                        angle: self.angle(),
                    }
                    .encode(),
                )?;
                send(stream, &reply).await
            }
            _ => {
                warn!(opcode = frame.opcode, "Unexpected frame for positioner");
                Ok(())
            }
        }
    }
}

fn encode_or_close(encoded: AppResult<Bytes>) -> Result<Bytes, Exit> {
    encoded.map_err(|e| {
        error!(error = %e, "Could not encode reply");
        Exit::Closed
    })
}

// =============================================================================
// SimulatedCamera
// =============================================================================

/// Simulated camera controller.
#[derive(Clone)]
pub struct SimulatedCamera {
    addr: SocketAddr,
    width: u32,
    height: u32,
    delay: Duration,
    frames: Arc<AtomicU32>,
}

impl SimulatedCamera {
    /// Creates a camera producing 64x64 images after 50 ms.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            width: 64,
            height: 64,
            delay: Duration::from_millis(50),
            frames: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Sets the image size in pixels.
    pub fn with_image_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Sets the time between a capture request and its answer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of images sent so far.
    pub fn frames_sent(&self) -> u32 {
        self.frames.load(Ordering::SeqCst)
    }

    /// Starts the connect/serve loop on the current runtime.
    pub fn spawn(&self) -> SimHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let device = self.clone();
        let task = tokio::spawn(
            async move {
                let addr = device.addr;
                connect_loop(addr, shutdown_rx, |stream, rx| {
                    let device = device.clone();
                    async move { device.serve(stream, rx).await }
                })
                .await
            }
            .instrument(info_span!("sim_camera")),
        );
        SimHandle {
            name: "camera",
            shutdown,
            task,
        }
    }

    async fn serve(&self, mut stream: TcpStream, mut shutdown: watch::Receiver<bool>) -> Exit {
        loop {
            let frame = match next_frame(&mut stream, &mut shutdown).await {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(exit) => return exit,
            };
            match CaptureMessage::from_frame(&frame) {
                Some(CaptureMessage::Capture { token, params }) => {
                    debug!(%token, ?params, "Capturing");
                    if let Err(exit) = pause(self.delay, &mut shutdown).await {
                        return exit;
                    }
                    let index = self.frames.fetch_add(1, Ordering::SeqCst);
                    let image = ramp_image(self.width, self.height, index);
                    let header = CaptureMessage::CaptureDone {
                        token,
                        stride_pixel: 2,
                        stride_row: self.width * 2,
                        sensor: 0,
                        payload_len: image.len() as u32,
                    };
                    let header = match encode_or_close(header.encode()) {
                        Ok(header) => header,
                        Err(exit) => return exit,
                    };
                    if let Err(exit) = send(&mut stream, &header).await {
                        return exit;
                    }
                    if let Err(exit) = send(&mut stream, &image).await {
                        return exit;
                    }
                }
                _ => warn!(opcode = frame.opcode, "Unexpected frame for camera"),
            }
        }
    }
}

/// Synthetic 16-bit little-endian image: a diagonal ramp shifted by `seed`.
pub fn ramp_image(width: u32, height: u32, seed: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity((width * height * 2) as usize);
    for y in 0..height {
        for x in 0..width {
            let value = (x.wrapping_add(y).wrapping_add(seed).wrapping_mul(64)) & 0xFFFF;
            buf.put_u16_le(value as u16);
        }
    }
    buf.freeze()
}
