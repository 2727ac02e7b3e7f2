//----------------------------------------------------------------------------------------------
// Module channel
// Transaction channel: one outstanding command at a time, responses and DAQ packets demultiplexed
// by a receive task sharing the transport

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::select;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Duration, Instant};

use crate::codec::{decode_messages, encode_message, CodecConfig, Command, DaqFrame, Frame};
use crate::error::{TransactionError, XcpError};
use crate::protocol::*;
use crate::transport::XcpTransport;

// Responses, errors and pending events waiting for the command path
const RESPONSE_QUEUE_SIZE: usize = 4;

//--------------------------------------------------------------------------------------------------------------------------------------------------
// Type to control the receive task sent over the receive task control channel

#[derive(Debug, Copy, Clone)]
pub struct XcpTaskControl {
    running: bool,
    connected: bool,
}

impl XcpTaskControl {
    #[allow(clippy::new_without_default)]
    pub fn new() -> XcpTaskControl {
        XcpTaskControl { running: false, connected: true }
    }
}

//--------------------------------------------------------------------------------------------------------------------------------------------------
// Statistics

#[derive(Debug, Default)]
struct ChannelCounters {
    messages: AtomicU64,
    malformed: AtomicU64,
    lost: AtomicU64,
    unsolicited: AtomicU64,
    daq_packets: AtomicU64,
    daq_overflow: AtomicU64,
}

impl ChannelCounters {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Receive path counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ChannelStatistics {
    /// Transport layer messages received
    pub messages: u64,
    /// Messages with corrupt transport layer header or packet
    pub malformed: u64,
    /// Messages lost, counted from gaps in the target's CTR
    pub lost: u64,
    /// Responses without an outstanding command
    pub unsolicited: u64,
    /// DAQ packets forwarded to the DAQ runtime
    pub daq_packets: u64,
    /// DAQ packets dropped because the DAQ queue was full
    pub daq_overflow: u64,
}

//--------------------------------------------------------------------------------------------------------------------------------------------------
// Command path seen by the unlock sequence and the DAQ configuration

#[async_trait::async_trait]
pub(crate) trait CommandSender: Sync {
    /// Encode, send and wait for the positive response
    async fn command(&self, cmd: &Command) -> Result<Vec<u8>, XcpError>;

    /// Negotiated codec parameters
    fn codec(&self) -> CodecConfig;
}

//--------------------------------------------------------------------------------------------------------------------------------------------------
// XcpChannel

struct CommandPath {
    rx_resp: Receiver<Frame>,
    // No command timed out since the last response
    synchronized: bool,
}

/// Serializes command transactions over a shared transport
pub struct XcpChannel {
    transport: Arc<dyn XcpTransport>,
    command: tokio::sync::Mutex<CommandPath>,
    ctr: AtomicU16,
    codec: Arc<parking_lot::RwLock<CodecConfig>>,
    counters: Arc<ChannelCounters>,
    tx_task_control: Sender<XcpTaskControl>,
    task_control: parking_lot::Mutex<XcpTaskControl>,
    receive_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl XcpChannel {
    //------------------------------------------------------------------------
    // receiver task
    // Handle incomming data from the XCP target
    async fn receive_task(
        transport: Arc<dyn XcpTransport>,
        tx_resp: Sender<Frame>,
        tx_daq: Sender<DaqFrame>,
        mut rx_task_control: Receiver<XcpTaskControl>,
        codec: Arc<parking_lot::RwLock<CodecConfig>>,
        counters: Arc<ChannelCounters>,
        buffer_size: usize,
    ) -> Result<(), TransactionError> {
        let mut ctr_last: u16 = 0;
        let mut ctr_first: bool = true;

        let mut buf = vec![0u8; buffer_size];
        let mut task_control = XcpTaskControl::new();

        loop {
            select! {
                biased;

                // Handle control changes before any further data
                res = rx_task_control.recv() => {
                    match res {
                        Some(c) => {
                            debug!("receive_task: task control status changed: connected={} running={}", c.connected, c.running);

                            // Disconnect
                            if !c.connected {
                                info!("receive_task: stop, disconnect");
                                return Ok(());
                            }

                            // Start DAQ
                            if c.running && !task_control.running {
                                info!("receive_task: start DAQ");
                                ctr_first = true;
                            }

                            task_control = c;
                        }
                        None => {
                            info!("receive_task: stop, channel closed");
                            return Ok(());
                        }
                    }
                }

                // Handle the data from the transport
                res = transport.recv(&mut buf) => {
                    let size = match res {
                        Ok(0) => {
                            warn!("receive_task: transport closed");
                            return Ok(());
                        }
                        Ok(size) => size,
                        Err(e) => {
                            error!("receive_task: transport error {}", e);
                            return Err(TransactionError::Transport(e));
                        }
                    };

                    let codec = *codec.read();
                    for msg in decode_messages(&buf[..size]) {
                        let msg = match msg {
                            Ok(msg) => msg,
                            Err(e) => {
                                ChannelCounters::inc(&counters.malformed);
                                warn!("receive_task: {}, datagram of {} bytes dropped", e, size);
                                break;
                            }
                        };
                        ChannelCounters::inc(&counters.messages);

                        if ctr_first {
                            ctr_first = false;
                        } else if msg.ctr != ctr_last.wrapping_add(1) {
                            let lost = msg.ctr.wrapping_sub(ctr_last).wrapping_sub(1);
                            counters.lost.fetch_add(lost as u64, Ordering::Relaxed);
                            debug!("receive_task: ctr {} -> {}, {} messages lost", ctr_last, msg.ctr, lost);
                        }
                        ctr_last = msg.ctr;

                        let frame = match Frame::decode(msg.packet, &codec) {
                            Ok(frame) => frame,
                            Err(e) => {
                                ChannelCounters::inc(&counters.malformed);
                                warn!("receive_task: {}, packet {:02X?} dropped", e, msg.packet);
                                continue;
                            }
                        };

                        match frame {
                            Frame::Response(_) | Frame::Error(_) | Frame::Event { code: EVC_CMD_PENDING, .. } => {
                                trace!("receive_task: {:?}", frame);
                                match tx_resp.try_send(frame) {
                                    Ok(()) => {}
                                    Err(TrySendError::Full(frame)) => {
                                        ChannelCounters::inc(&counters.unsolicited);
                                        warn!("receive_task: unsolicited {:?} dropped", frame);
                                    }
                                    Err(TrySendError::Closed(_)) => {
                                        info!("receive_task: stop, command path closed");
                                        return Ok(());
                                    }
                                }
                            }
                            Frame::Event { code: EVC_SESSION_TERMINATED, .. } => {
                                warn!("receive_task: session terminated by target");
                            }
                            Frame::Event { code, .. } => {
                                info!("receive_task: ignored XCP event = 0x{:02X}", code);
                            }
                            Frame::ServiceRequest { code: SERV_TEXT, data } => {
                                let end = data.iter().position(|&c| c == 0).unwrap_or(data.len());
                                info!("SERV_TEXT: {}", String::from_utf8_lossy(&data[..end]).trim_end());
                            }
                            Frame::ServiceRequest { code, .. } => {
                                warn!("receive_task: unknown service request code = 0x{:02X} ignored", code);
                            }
                            Frame::DaqData(daq_frame) => {
                                if !task_control.running {
                                    trace!("receive_task: DAQ packet while not running dropped");
                                    continue;
                                }
                                match tx_daq.try_send(daq_frame) {
                                    Ok(()) => ChannelCounters::inc(&counters.daq_packets),
                                    Err(TrySendError::Full(_)) => ChannelCounters::inc(&counters.daq_overflow),
                                    Err(TrySendError::Closed(_)) => trace!("receive_task: DAQ runtime gone, packet dropped"),
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Spawn the receive task on the transport
    /// DAQ packets are forwarded to `tx_daq` while DAQ is running
    pub fn open(transport: Arc<dyn XcpTransport>, tx_daq: Sender<DaqFrame>, receive_buffer_size: usize) -> XcpChannel {
        let codec = Arc::new(parking_lot::RwLock::new(CodecConfig::default()));
        let counters = Arc::new(ChannelCounters::default());
        let (tx_resp, rx_resp) = mpsc::channel(RESPONSE_QUEUE_SIZE);
        let (tx_task_control, rx_task_control) = mpsc::channel(3);

        let receive_task = {
            let transport = Arc::clone(&transport);
            let codec = Arc::clone(&codec);
            let counters = Arc::clone(&counters);
            tokio::spawn(async move {
                if let Err(e) = XcpChannel::receive_task(transport, tx_resp, tx_daq, rx_task_control, codec, counters, receive_buffer_size).await {
                    error!("receive_task: terminated with {}", e);
                }
            })
        };

        XcpChannel {
            transport,
            command: tokio::sync::Mutex::new(CommandPath { rx_resp, synchronized: true }),
            ctr: AtomicU16::new(0),
            codec,
            counters,
            tx_task_control,
            task_control: parking_lot::Mutex::new(XcpTaskControl::new()),
            receive_task: parking_lot::Mutex::new(Some(receive_task)),
        }
    }

    /// Codec parameters used to classify received packets
    pub fn set_codec(&self, codec: CodecConfig) {
        *self.codec.write() = codec;
    }

    pub fn codec(&self) -> CodecConfig {
        *self.codec.read()
    }

    fn next_ctr(&self) -> u16 {
        self.ctr.fetch_add(1, Ordering::Relaxed)
    }

    //------------------------------------------------------------------------
    // XCP command service
    // Send a XCP command and wait for the response, resend the identical command on timeout
    // `response_len` is the minimum length of a positive response to this command

    pub async fn send_command(&self, cmd: &[u8], response_len: usize, timeout: Duration, max_retries: u32) -> Result<Vec<u8>, TransactionError> {
        let code = cmd.first().copied().unwrap_or(0);

        // Held until the transaction is resolved
        let mut path = self.command.lock().await;

        // A response to an earlier command may still be on its way
        if !path.synchronized {
            self.synchronize(&mut path, timeout, max_retries).await?;
        }

        let mut attempt: u32 = 0;
        loop {
            self.discard_late(&mut path);

            trace!("send_command: cmd = {:02X?}", cmd);
            self.transport.send(&encode_message(self.next_ctr(), cmd)).await?;

            match self.wait_response(&mut path.rx_resp, response_len, timeout).await? {
                Some(data) => {
                    trace!("send_command: res = {:02X?}", data);
                    if attempt > 0 {
                        // The response to the first attempt may arrive later
                        path.synchronized = false;
                    }
                    return Ok(data);
                }
                None => {
                    if attempt >= max_retries {
                        warn!("send_command: command 0x{:02X} timeout after {} attempts", code, attempt + 1);
                        path.synchronized = false;
                        return Err(TransactionError::Timeout);
                    }
                    attempt += 1;
                    warn!("send_command: command 0x{:02X} timeout, retry {}/{}", code, attempt, max_retries);
                }
            }
        }
    }

    // Discard responses to earlier commands which arrived after their timeout
    fn discard_late(&self, path: &mut CommandPath) {
        while let Ok(frame) = path.rx_resp.try_recv() {
            ChannelCounters::inc(&self.counters.unsolicited);
            debug!("send_command: discarded late {:?}", frame);
        }
    }

    // Resynchronize the command path with SYNCH after a timeout
    // Everything received before ERR_CMD_SYNCH belongs to earlier commands
    async fn synchronize(&self, path: &mut CommandPath, timeout: Duration, max_retries: u32) -> Result<(), TransactionError> {
        for attempt in 0..=max_retries {
            self.discard_late(path);
            debug!("send_command: out of sync, SYNCH attempt {}", attempt + 1);
            self.transport.send(&encode_message(self.next_ctr(), &[CC_SYNCH])).await?;

            let mut deadline = Instant::now() + timeout;
            loop {
                match timeout_at(deadline, path.rx_resp.recv()).await {
                    Err(_) => break,
                    Ok(None) => return Err(TransactionError::Closed),
                    Ok(Some(Frame::Error(code))) if code.0 == CRC_CMD_SYNCH => {
                        debug!("send_command: synchronized");
                        path.synchronized = true;
                        return Ok(());
                    }
                    Ok(Some(Frame::Event { code: EVC_CMD_PENDING, .. })) => deadline = Instant::now() + timeout,
                    Ok(Some(frame)) => {
                        ChannelCounters::inc(&self.counters.unsolicited);
                        debug!("send_command: discarded late {:?}", frame);
                    }
                }
            }
        }
        warn!("send_command: no response to SYNCH, command path out of sync");
        Err(TransactionError::Timeout)
    }

    // Wait for a response or error, returns None on timeout
    async fn wait_response(&self, rx_resp: &mut Receiver<Frame>, response_len: usize, timeout: Duration) -> Result<Option<Vec<u8>>, TransactionError> {
        let mut deadline = Instant::now() + timeout;
        loop {
            match timeout_at(deadline, rx_resp.recv()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Err(TransactionError::Closed),
                Ok(Some(Frame::Response(data))) if data.len() < response_len => {
                    ChannelCounters::inc(&self.counters.unsolicited);
                    debug!("send_command: response {:02X?} shorter than {} bytes discarded", data, response_len);
                }
                Ok(Some(Frame::Response(data))) => return Ok(Some(data)),
                Ok(Some(Frame::Error(code))) => {
                    debug!("send_command: negative response {}", code);
                    return Err(TransactionError::Rejected(code));
                }
                Ok(Some(Frame::Event { code: EVC_CMD_PENDING, .. })) => {
                    debug!("send_command: EV_CMD_PENDING, restart timeout");
                    deadline = Instant::now() + timeout;
                }
                Ok(Some(frame)) => trace!("send_command: ignored {:?}", frame),
            }
        }
    }

    /// Send a data packet (STIM), not serialized with commands
    pub async fn send_packet(&self, packet: &[u8]) -> Result<(), TransactionError> {
        self.transport.send(&encode_message(self.next_ctr(), packet)).await?;
        Ok(())
    }

    //------------------------------------------------------------------------
    // Receive task control

    /// Enable or disable forwarding of DAQ packets
    pub async fn set_running(&self, running: bool) {
        let control = {
            let mut c = self.task_control.lock();
            c.running = running;
            *c
        };
        if self.tx_task_control.send(control).await.is_err() {
            debug!("set_running: receive task already terminated");
        }
    }

    pub fn is_open(&self) -> bool {
        self.receive_task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the receive task, does not wait for it to terminate
    pub async fn close(&self) {
        let control = {
            let mut c = self.task_control.lock();
            c.connected = false;
            c.running = false;
            *c
        };
        let _ = self.tx_task_control.try_send(control);
        if let Some(receive_task) = self.receive_task.lock().take() {
            receive_task.abort();
        }
    }

    pub fn statistics(&self) -> ChannelStatistics {
        let c = &self.counters;
        ChannelStatistics {
            messages: c.messages.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            lost: c.lost.load(Ordering::Relaxed),
            unsolicited: c.unsolicited.load(Ordering::Relaxed),
            daq_packets: c.daq_packets.load(Ordering::Relaxed),
            daq_overflow: c.daq_overflow.load(Ordering::Relaxed),
        }
    }
}

impl Drop for XcpChannel {
    fn drop(&mut self) {
        if let Some(receive_task) = self.receive_task.lock().take() {
            receive_task.abort();
        }
    }
}

//----------------------------------------------------------------------------------------------
