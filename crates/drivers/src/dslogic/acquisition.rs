//! DSLogic streaming acquisition: FPGA programming, the bulk transfer
//! ring, and software trigger matching.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, info, warn};

use meas_types::{DeviceId, DeviceStatus, Error, Logic, MetaLogic, Packet, Result};
use session::{EventSource, Session, SourceKey, Timeout, Wakeup};
use transport::USB_TIMEOUT;

use super::driver::DslogicState;
use super::protocol::{self, FpgaConfig, SoftTrigger};

/// How long one completion poll may wait inside a dispatch.
const POLL_WAIT: Duration = Duration::from_millis(1);

pub(crate) struct DslogicAcquisition {
    device: DeviceId,
    state: Rc<RefCell<DslogicState>>,
    wide: bool,
    unitsize: usize,
    limit_samples: u64,
    num_samples: u64,
    soft_trigger: Option<SoftTrigger>,
    buffer_size: usize,
    empty_count: usize,
    finished: bool,
}

impl DslogicAcquisition {
    /// Program the FPGA, arm the device, prime the transfer ring and
    /// register the completion source.
    pub(crate) fn start(state_rc: Rc<RefCell<DslogicState>>, session: &Session) -> Result<()> {
        let mut guard = state_rc.borrow_mut();
        let state = &mut *guard;
        if state.source_key.is_some() {
            return Err(Error::General("acquisition already running".into()));
        }
        let enabled: Vec<_> = state.probes.iter().filter(|p| p.enabled).collect();
        if enabled.is_empty() {
            return Err(Error::General("no probes enabled".into()));
        }
        let wide = enabled.iter().any(|p| p.index >= 8);
        let enabled_count = enabled.len() as u16;
        let mut ch_en = 0u32;
        for probe in &enabled {
            ch_en |= 1 << probe.index;
        }

        let rate = state.cur_samplerate;
        let limit = state.limit_samples;
        let rle = state.rle || protocol::rle_required(limit, rate, state.continuous);
        if rle && !state.rle {
            info!("capture exceeds device memory, enabling RLE");
        }
        let trigger = protocol::build_trigger(&state.probes);
        let mode = protocol::mode_word(
            rate,
            state.continuous,
            rle,
            state.test_mode,
            trigger.armed,
            state.external_clock,
        );
        let num_stages = trigger.num_stages;
        let cfg = FpgaConfig {
            mode,
            divider: (protocol::DS_MAX_LOGIC_SAMPLERATE.div_ceil(rate.max(1)).max(1)) as u32,
            count: (limit / protocol::DSLOGIC_ATOMIC_SAMPLES) as u32,
            trig_pos: protocol::trigger_position(
                state.capture_ratio,
                limit,
                state.profile.mem_depth,
                state.continuous,
            ),
            trig_glb: (enabled_count << 4) | (num_stages.saturating_sub(1) as u16 & 0xf),
            ch_en,
            trigger,
        };
        let soft_trigger = SoftTrigger::from_probes(&state.probes);

        let Some(usb) = state.usb.as_mut() else {
            return Err(Error::General("device is not open".into()));
        };
        let usb = usb.as_mut();

        let frame = cfg.to_bytes();
        debug!("sending {} byte FPGA configuration", frame.len());
        usb.control_out(protocol::CMD_SETTING, 0, 0, &cfg.setting_len(), USB_TIMEOUT)
            .map_err(Error::from)?;
        let written = usb
            .bulk_out(protocol::EP_CONFIG_OUT, &frame, USB_TIMEOUT)
            .map_err(Error::from)?;
        if written != frame.len() {
            return Err(transport::TransportError::ShortTransfer {
                expected: frame.len(),
                actual: written,
            }
            .into());
        }
        usb.control_out(
            protocol::CMD_START,
            0,
            0,
            &protocol::start_command(wide, false),
            USB_TIMEOUT,
        )
        .map_err(Error::from)?;

        let buffer_size = protocol::get_buffer_size(rate);
        let num_transfers = protocol::get_number_of_transfers(rate);
        debug!("{} transfers of {} bytes in flight", num_transfers, buffer_size);
        for _ in 0..num_transfers {
            usb.submit_bulk_in(protocol::EP_SAMPLES_IN, buffer_size)
                .map_err(Error::from)?;
        }

        let key = SourceKey(Rc::as_ptr(&state_rc) as u64);
        state.source_key = Some(key);
        state.stop_requested = false;
        let device = state.id;
        drop(guard);

        session.send_header(device);
        session.send(
            device,
            &Packet::MetaLogic(MetaLogic {
                num_probes: enabled_count,
                samplerate: rate,
            }),
        );
        session.source_add(
            key,
            Timeout::Poll,
            Box::new(DslogicAcquisition {
                device,
                state: state_rc.clone(),
                wide,
                unitsize: if wide { 2 } else { 1 },
                limit_samples: limit,
                num_samples: 0,
                soft_trigger,
                buffer_size,
                empty_count: 0,
                finished: false,
            }),
        );
        Ok(())
    }

    fn send_logic(&self, session: &Session, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        match Logic::new(self.unitsize, data) {
            Ok(logic) => session.send(self.device, &Packet::Logic(logic)),
            Err(e) => error!("{}: dropped malformed logic block: {}", self.device, e),
        }
    }

    /// Feed one completed transfer into the datafeed. Returns false once
    /// the sample limit is reached.
    fn process_transfer(&mut self, session: &Session, data: &[u8]) -> bool {
        let whole_samples = data.len() / self.unitsize;
        let mut start = 0usize;
        if let Some(trigger) = self.soft_trigger.as_mut() {
            if trigger.active() {
                let mut fired_at = None;
                for i in 0..whole_samples {
                    let sample = if self.wide {
                        LittleEndian::read_u16(&data[i * 2..i * 2 + 2])
                    } else {
                        data[i] as u16
                    };
                    if trigger.process(sample) {
                        fired_at = Some(i);
                        break;
                    }
                }
                match fired_at {
                    Some(i) => {
                        debug!("{}: software trigger matched", self.device);
                        session.send_trigger(self.device);
                        start = i;
                    }
                    // Still hunting; everything seen was pre-trigger.
                    None => return true,
                }
            }
        }
        let available = (whole_samples - start) as u64;
        let take = available.min(self.limit_samples - self.num_samples) as usize;
        self.send_logic(
            session,
            &data[start * self.unitsize..(start + take) * self.unitsize],
        );
        self.num_samples += take as u64;
        self.num_samples < self.limit_samples
    }

    fn finalize(&mut self, session: &Session) {
        if self.finished {
            return;
        }
        self.finished = true;
        info!("{}: acquisition done, {} samples", self.device, self.num_samples);
        session.send_end(self.device);
        let mut state = self.state.borrow_mut();
        if let Some(usb) = state.usb.as_mut() {
            let stop = protocol::start_command(self.wide, true);
            if let Err(e) = usb.control_out(protocol::CMD_START, 0, 0, &stop, USB_TIMEOUT) {
                warn!("{}: stop command failed: {}", self.device, e);
            }
        }
        state.source_key = None;
        state.stop_requested = false;
        state.status = DeviceStatus::Inactive;
    }
}

impl EventSource for DslogicAcquisition {
    fn readiness(&mut self) -> std::io::Result<bool> {
        // Completions can only be observed by polling; the source runs on
        // the poll timeout instead.
        Ok(false)
    }

    fn dispatch(&mut self, session: &Session, _wakeup: Wakeup) -> bool {
        if self.finished {
            return false;
        }
        if self.state.borrow().stop_requested {
            self.finalize(session);
            return false;
        }
        let polled = {
            let mut state = self.state.borrow_mut();
            match state.usb.as_mut() {
                Some(usb) => usb.poll_bulk_in(protocol::EP_SAMPLES_IN, POLL_WAIT),
                None => {
                    drop(state);
                    warn!("{}: transport vanished mid-stream", self.device);
                    self.finalize(session);
                    return false;
                }
            }
        };
        let completed = match polled {
            Ok(c) => c,
            Err(e) => {
                warn!("{}: transfer failed: {}", self.device, e);
                self.finalize(session);
                return false;
            }
        };
        let Some(data) = completed else {
            // Nothing completed within the poll window.
            return true;
        };
        if data.is_empty() {
            self.empty_count += 1;
            if self.empty_count >= protocol::empty_transfer_limit() {
                warn!("{}: device stalled, aborting", self.device);
                self.finalize(session);
                return false;
            }
        } else {
            self.empty_count = 0;
            if !self.process_transfer(session, &data) {
                self.finalize(session);
                return false;
            }
        }
        // Keep the ring full.
        let resubmit = {
            let mut state = self.state.borrow_mut();
            match state.usb.as_mut() {
                Some(usb) => usb.submit_bulk_in(protocol::EP_SAMPLES_IN, self.buffer_size),
                None => Ok(()),
            }
        };
        if let Err(e) = resubmit {
            warn!("{}: resubmit failed: {}", self.device, e);
            self.finalize(session);
            return false;
        }
        true
    }
}
