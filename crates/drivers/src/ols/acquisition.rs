//! OLS capture programming and the receive state machine.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, info, warn};

use meas_types::{DeviceId, DeviceStatus, Error, Logic, MetaLogic, Packet, Result};
use session::{EventSource, Session, SourceKey, Timeout, Wakeup};

use super::driver::{OlsState, TestPattern};
use super::protocol::{self, capture_size_word, reversed_word, send_longcommand, send_shortcommand};

/// Silence on the line longer than this after the first byte means the
/// device is done transmitting.
const EOS_SILENCE: Duration = Duration::from_millis(30);

/// Largest read per dispatch, keeping each loop turn bounded.
const READ_CHUNK: usize = 256;

pub(crate) struct OlsAcquisition {
    device: DeviceId,
    key: SourceKey,
    state: Rc<RefCell<OlsState>>,
    group_enabled: [bool; 4],
    num_groups: usize,
    limit_samples: usize,
    trigger_at: i64,
    rle: bool,
    /// Capture buffer, `limit_samples * 4` bytes, filled from the end
    /// because the device transmits youngest samples first.
    raw_buf: Vec<u8>,
    num_samples: usize,
    sample: [u8; 4],
    num_bytes: usize,
    rle_count: u64,
    started: bool,
    finished: bool,
}

impl OlsAcquisition {
    /// Program the device and register the receive source.
    pub(crate) fn start(state_rc: Rc<RefCell<OlsState>>, session: &Session) -> Result<()> {
        let mut guard = state_rc.borrow_mut();
        let state = &mut *guard;
        if state.source_key.is_some() {
            return Err(Error::General("acquisition already running".into()));
        }
        if state.limit_samples < protocol::MIN_NUM_SAMPLES {
            return Err(Error::General(format!(
                "minimum of {} samples required",
                protocol::MIN_NUM_SAMPLES
            )));
        }

        let mut probe_mask: u32 = 0;
        for probe in state.probes.iter().filter(|p| p.enabled) {
            probe_mask |= 1 << probe.index;
        }
        let mut group_enabled = [false; 4];
        for (i, enabled) in group_enabled.iter_mut().enumerate() {
            *enabled = probe_mask & (0xff << (8 * i)) != 0;
        }
        let num_groups = group_enabled.iter().filter(|&&g| g).count();
        if num_groups == 0 {
            return Err(Error::General("no probes enabled".into()));
        }

        let mut masks = [0u32; protocol::NUM_TRIGGER_STAGES];
        let mut values = [0u32; protocol::NUM_TRIGGER_STAGES];
        let mut num_stages = 0usize;
        for probe in state.probes.iter().filter(|p| p.enabled) {
            let Some(expr) = &probe.trigger else {
                continue;
            };
            for (stage, ch) in expr.chars().enumerate().take(protocol::NUM_TRIGGER_STAGES) {
                masks[stage] |= 1 << probe.index;
                if ch == '1' {
                    values[stage] |= 1 << probe.index;
                }
                num_stages = num_stages.max(stage + 1);
            }
        }

        let samplecount = if state.max_samples > 0 {
            (state.max_samples / num_groups as u64).min(state.limit_samples)
        } else {
            state.limit_samples
        };
        // Rather read too many samples than too few.
        let readcount = samplecount.div_ceil(4) as u32;
        let (delaycount, trigger_at) = if num_stages > 0 {
            let delay = (readcount as f64 * (1.0 - state.capture_ratio as f64 / 100.0)) as u32;
            let at = (readcount as i64 - delay as i64) * 4 - num_stages as i64;
            (delay, at)
        } else {
            (readcount, -1)
        };
        debug!(
            "readcount {}, delaycount {}, trigger at sample {}",
            readcount, delaycount, trigger_at
        );

        let Some(serial) = state.serial.as_mut() else {
            return Err(Error::General("device is not open".into()));
        };
        let serial = serial.as_mut();

        if num_stages > 0 {
            for stage in 0..num_stages {
                debug!(
                    "stage {}: mask 0x{:08x}, value 0x{:08x}",
                    stage, masks[stage], values[stage]
                );
                send_longcommand(
                    serial,
                    protocol::trigger_mask_cmd(stage),
                    reversed_word(masks[stage]),
                )
                .map_err(Error::from)?;
                send_longcommand(
                    serial,
                    protocol::trigger_value_cmd(stage),
                    reversed_word(values[stage]),
                )
                .map_err(Error::from)?;
                let config = if stage == num_stages - 1 {
                    protocol::TRIGGER_START
                } else {
                    0
                };
                send_longcommand(
                    serial,
                    protocol::trigger_config_cmd(stage),
                    reversed_word(config),
                )
                .map_err(Error::from)?;
            }
        } else {
            // No triggers configured: force capture start at stage 0.
            send_longcommand(serial, protocol::trigger_mask_cmd(0), reversed_word(0))
                .map_err(Error::from)?;
            send_longcommand(serial, protocol::trigger_value_cmd(0), reversed_word(0))
                .map_err(Error::from)?;
            send_longcommand(
                serial,
                protocol::trigger_config_cmd(0),
                reversed_word(protocol::TRIGGER_START),
            )
            .map_err(Error::from)?;
        }

        send_longcommand(
            serial,
            protocol::CMD_SET_DIVIDER,
            reversed_word(state.divider & 0x00ff_ffff),
        )
        .map_err(Error::from)?;
        send_longcommand(
            serial,
            protocol::CMD_CAPTURE_SIZE,
            capture_size_word(readcount, delaycount),
        )
        .map_err(Error::from)?;

        let mut flags: u16 = 0;
        if state.demux {
            flags |= protocol::FLAG_DEMUX;
        } else if state.filter {
            flags |= protocol::FLAG_FILTER;
        }
        for (i, enabled) in group_enabled.iter().enumerate() {
            if !enabled {
                flags |= 1 << (2 + i);
            }
        }
        if state.rle {
            debug!("RLE mode enabled");
            flags |= protocol::FLAG_RLE;
        }
        if state.external_clock {
            debug!("sampling on the external clock input");
            flags |= protocol::FLAG_CLOCK_EXTERNAL;
        }
        match state.pattern {
            TestPattern::Internal => flags |= protocol::FLAG_INTERNAL_TEST,
            TestPattern::External => flags |= protocol::FLAG_EXTERNAL_TEST,
            TestPattern::Off => {}
        }
        send_longcommand(serial, protocol::CMD_SET_FLAGS, reversed_word(flags as u32))
            .map_err(Error::from)?;
        send_shortcommand(serial, protocol::CMD_RUN).map_err(Error::from)?;

        let key = SourceKey(Rc::as_ptr(&state_rc) as u64);
        state.source_key = Some(key);
        state.stop_requested = false;
        let device = state.id;
        let samplerate = state.cur_samplerate;
        let rle = state.rle;
        let limit_samples = state.limit_samples as usize;
        let enabled_probes = state.probes.iter().filter(|p| p.enabled).count() as u16;
        drop(guard);

        session.send_header(device);
        session.send(
            device,
            &Packet::MetaLogic(MetaLogic {
                num_probes: enabled_probes,
                samplerate,
            }),
        );

        session.source_add(
            key,
            Timeout::Infinite,
            Box::new(OlsAcquisition {
                device,
                key,
                state: state_rc.clone(),
                group_enabled,
                num_groups,
                limit_samples,
                trigger_at,
                rle,
                raw_buf: vec![0; limit_samples * 4],
                num_samples: 0,
                sample: [0; 4],
                num_bytes: 0,
                rle_count: 0,
                started: false,
                finished: false,
            }),
        );
        Ok(())
    }

    fn process_byte(&mut self, byte: u8) {
        self.sample[self.num_bytes] = byte;
        self.num_bytes += 1;
        if self.num_bytes < self.num_groups {
            return;
        }
        self.num_bytes = 0;

        if self.rle && self.sample[self.num_groups - 1] & 0x80 != 0 {
            self.sample[self.num_groups - 1] &= 0x7f;
            // The count arrives in the device's sample byte order; read it
            // as an explicit little-endian integer.
            let count = LittleEndian::read_uint(&self.sample[..self.num_groups], self.num_groups);
            self.rle_count += count;
            debug!("RLE count {}", count);
            self.sample = [0; 4];
            return;
        }

        let repeats = self.rle_count + 1;
        self.rle_count = 0;
        let mut expanded = [0u8; 4];
        let mut j = 0;
        for (i, enabled) in self.group_enabled.iter().enumerate() {
            // Disabled groups were not transmitted; expand them as zero so
            // the frontend always sees full 32-bit samples.
            if *enabled {
                expanded[i] = self.sample[j];
                j += 1;
            }
        }
        self.sample = [0; 4];
        for _ in 0..repeats {
            if self.num_samples >= self.limit_samples {
                // Device sent more than requested; discard the excess.
                break;
            }
            self.num_samples += 1;
            let offset = (self.limit_samples - self.num_samples) * 4;
            self.raw_buf[offset..offset + 4].copy_from_slice(&expanded);
        }
    }

    fn send_logic(&self, session: &Session, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        match Logic::new(4, data) {
            Ok(logic) => session.send(self.device, &Packet::Logic(logic)),
            Err(e) => error!("{}: dropped malformed logic block: {}", self.device, e),
        }
    }

    /// Flush captured samples, terminate the stream and release the port.
    fn finalize(&mut self, session: &Session) {
        if self.finished {
            return;
        }
        self.finished = true;
        info!("{}: capture done, {} samples", self.device, self.num_samples);
        let valid_from = (self.limit_samples - self.num_samples) * 4;
        let valid = &self.raw_buf[valid_from..];
        if !valid.is_empty() {
            if self.trigger_at >= 0 {
                let split = ((self.trigger_at as usize) * 4).min(valid.len());
                self.send_logic(session, &valid[..split]);
                session.send_trigger(self.device);
                self.send_logic(session, &valid[split..]);
            } else {
                self.send_logic(session, valid);
            }
        }
        session.send_end(self.device);
        let mut state = self.state.borrow_mut();
        state.serial = None;
        state.source_key = None;
        state.stop_requested = false;
        state.status = DeviceStatus::Inactive;
    }
}

impl EventSource for OlsAcquisition {
    fn readiness(&mut self) -> std::io::Result<bool> {
        let mut state = self.state.borrow_mut();
        match state.serial.as_mut() {
            Some(serial) => serial
                .bytes_available()
                .map(|n| n > 0)
                .map_err(|e| std::io::Error::other(e.to_string())),
            None => Ok(false),
        }
    }

    fn dispatch(&mut self, session: &Session, wakeup: Wakeup) -> bool {
        if self.finished {
            return false;
        }
        if self.state.borrow().stop_requested {
            self.finalize(session);
            return false;
        }
        match wakeup {
            Wakeup::Ready => {
                let mut chunk = [0u8; READ_CHUNK];
                let read = {
                    let mut state = self.state.borrow_mut();
                    match state.serial.as_mut() {
                        Some(serial) => serial.read(&mut chunk),
                        None => {
                            drop(state);
                            warn!("{}: transport vanished mid-capture", self.device);
                            self.finalize(session);
                            return false;
                        }
                    }
                };
                let n = match read {
                    Ok(n) => n,
                    Err(e) => {
                        warn!("{}: read failed: {}", self.device, e);
                        self.finalize(session);
                        return false;
                    }
                };
                if n == 0 {
                    return true;
                }
                if !self.started {
                    self.started = true;
                    // From here on, silence means end of stream.
                    let _ = session.source_set_timeout(self.key, Timeout::After(EOS_SILENCE));
                }
                for &byte in &chunk[..n] {
                    self.process_byte(byte);
                }
                true
            }
            Wakeup::Timeout => {
                if !self.started {
                    return true;
                }
                self.finalize(session);
                false
            }
        }
    }
}
