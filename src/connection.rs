//! The connection façade: ties the record layer, key schedule and the role
//! state machines together behind the caller-facing operations.
//!
//! A connection never performs I/O. `handshake` consumes inbound bytes and
//! appends everything to transmit to the caller's send buffer; `send` and
//! `receive` move application data once the handshake completes;
//! `handle_message` is the message-oriented entry point for QUIC stacks that
//! run their own record protection via the `update_traffic_key` capability.

use std::any::Any;
use std::sync::Arc;

use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::buffer::Buffer;
use crate::client::ClientHandshake;
use crate::config::{Context, HandshakeProperties};
use crate::crypto::CipherSuite;
use crate::errors::{AlertDescription, Error, ALERT_LEVEL_FATAL, ALERT_LEVEL_WARNING};
use crate::key_schedule::{hkdf_expand_label, KeySchedule};
use crate::msgs::{HandshakeType, MessageJoiner};
use crate::record::{
  emit_plaintext_record, parse_record_header, ContentType, TrafficProtection,
  CHANGE_CIPHER_SPEC_RECORD, MAX_CIPHERTEXT_RECORD_SIZE, RECORD_HEADER_SIZE, SEQ_SOFT_LIMIT,
};
use crate::server::ServerHandshake;
use crate::ticket::CachedSession;

/// Connection role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
  Client,
  Server,
}

/// Epochs of the four traffic-protection generations.
pub const EPOCH_INITIAL: usize = 0;
pub const EPOCH_EARLY: usize = 1;
pub const EPOCH_HANDSHAKE: usize = 2;
pub const EPOCH_APPLICATION: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
  ClientStart,
  ClientExpectServerHello,
  ClientExpectSecondServerHello,
  ClientExpectEncryptedExtensions,
  ClientExpectCertOrCertReq,
  ClientExpectCertificate,
  ClientExpectCertificateVerify,
  ClientExpectFinished,
  ClientPostHandshake,
  ServerExpectClientHello,
  ServerExpectSecondClientHello,
  ServerExpectEndOfEarlyData,
  ServerExpectCertificate,
  ServerExpectCertificateVerify,
  ServerExpectFinished,
  ServerPostHandshake,
  Failed,
}

/// Result of a `handshake` / `handle_message` call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
  /// Handshake finished; `consumed` bytes of the input were used, the rest
  /// (if any) belongs to the application-data stream.
  Complete { consumed: usize },
  /// More input (or a peer round-trip) is required; all input was consumed.
  InProgress,
}

/// Result of a `receive` call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
  /// One record was processed; `consumed` bytes of input were used. The
  /// plaintext buffer may still be empty (e.g. for a post-handshake message).
  Record { consumed: usize },
  /// The record is incomplete; all input was consumed.
  InProgress,
}

pub(crate) struct EmitItem {
  pub epoch: usize,
  pub content: ContentType,
  pub bytes: Vec<u8>,
}

/// Both handshake traffic secrets, kept for the Finished exchanges.
pub(crate) struct HandshakeSecrets {
  pub client: Zeroizing<Vec<u8>>,
  pub server: Zeroizing<Vec<u8>>,
}

/// A TLS 1.3 connection (sans I/O).
pub struct Connection {
  pub(crate) ctx: Arc<Context>,
  pub(crate) side: Side,
  pub(crate) state: State,
  pub(crate) server_name: Option<String>,
  pub(crate) negotiated_protocol: Option<Vec<u8>>,
  pub(crate) client_random: [u8; 32],
  pub(crate) suite: Option<&'static CipherSuite>,
  pub(crate) negotiated_group: Option<u16>,
  pub(crate) key_schedule: Option<KeySchedule>,
  pub(crate) enc: [Option<TrafficProtection>; 4],
  pub(crate) dec: [Option<TrafficProtection>; 4],
  pub(crate) write_epoch: usize,
  pub(crate) read_epoch: usize,
  pub(crate) emit_queue: Vec<EmitItem>,
  pub(crate) recv_record_buf: Vec<u8>,
  pub(crate) joiner: MessageJoiner,
  pub(crate) pending_by_epoch: [Vec<u8>; 4],
  pub(crate) early_data_buf: Zeroizing<Vec<u8>>,
  pub(crate) early_data_received: usize,
  pub(crate) handshake_complete: bool,
  pub(crate) psk_used: bool,
  pub(crate) early_data_offered: bool,
  pub(crate) early_data_accepted: bool,
  pub(crate) max_early_data_size: u32,
  pub(crate) change_cipher_spec_sent: bool,
  pub(crate) pending_key_update: bool,
  pub(crate) hs_secrets: Option<HandshakeSecrets>,
  pub(crate) exporter_master: Option<Zeroizing<Vec<u8>>>,
  pub(crate) early_exporter_master: Option<Zeroizing<Vec<u8>>>,
  pub(crate) resumption_master: Option<Zeroizing<Vec<u8>>>,
  pub(crate) client_hs: Option<ClientHandshake>,
  pub(crate) server_hs: Option<ServerHandshake>,
  pub(crate) data_ptr: Option<Box<dyn Any + Send>>,
}

impl Connection {
  /// Creates a connection. A client must be given a server name via
  /// [`Connection::set_server_name`] before the handshake is driven if SNI is
  /// to be sent.
  pub fn new(ctx: Arc<Context>, side: Side) -> Self {
    if let Some(counter) = &ctx.update_open_count {
      counter.update(1);
    }
    let state = match side {
      Side::Client => State::ClientStart,
      Side::Server => State::ServerExpectClientHello,
    };
    Connection {
      ctx,
      side,
      state,
      server_name: None,
      negotiated_protocol: None,
      client_random: [0; 32],
      suite: None,
      negotiated_group: None,
      key_schedule: None,
      enc: Default::default(),
      dec: Default::default(),
      write_epoch: EPOCH_INITIAL,
      read_epoch: EPOCH_INITIAL,
      emit_queue: Vec::new(),
      recv_record_buf: Vec::new(),
      joiner: MessageJoiner::default(),
      pending_by_epoch: Default::default(),
      early_data_buf: Zeroizing::new(Vec::new()),
      early_data_received: 0,
      handshake_complete: false,
      psk_used: false,
      early_data_offered: false,
      early_data_accepted: false,
      max_early_data_size: 0,
      change_cipher_spec_sent: false,
      pending_key_update: false,
      hs_secrets: None,
      exporter_master: None,
      early_exporter_master: None,
      resumption_master: None,
      client_hs: None,
      server_hs: None,
      data_ptr: None,
    }
  }

  // === Accessors ===

  pub fn get_context(&self) -> &Arc<Context> {
    &self.ctx
  }

  /// Swaps the configuration; intended to be called from `on_client_hello`.
  pub fn set_context(&mut self, ctx: Arc<Context>) {
    self.ctx = ctx;
  }

  pub fn is_server(&self) -> bool {
    self.side == Side::Server
  }

  pub fn handshake_is_complete(&self) -> bool {
    self.handshake_complete
  }

  pub fn is_psk_handshake(&self) -> bool {
    self.psk_used
  }

  pub fn get_cipher(&self) -> Option<&'static CipherSuite> {
    self.suite
  }

  /// The negotiated key-exchange group, once known.
  pub fn get_negotiated_group(&self) -> Option<u16> {
    self.negotiated_group
  }

  pub fn get_client_random(&self) -> &[u8; 32] {
    &self.client_random
  }

  pub fn get_server_name(&self) -> Option<&str> {
    self.server_name.as_deref()
  }

  pub fn set_server_name(&mut self, server_name: &str) {
    self.server_name = Some(server_name.to_string());
  }

  pub fn get_negotiated_protocol(&self) -> Option<&[u8]> {
    self.negotiated_protocol.as_deref()
  }

  pub fn set_negotiated_protocol(&mut self, protocol: &[u8]) {
    self.negotiated_protocol = Some(protocol.to_vec());
  }

  /// Bytes of overhead added to each sealed record.
  pub fn get_record_overhead(&self) -> usize {
    match self.suite {
      Some(suite) => RECORD_HEADER_SIZE + 1 + suite.aead.tag_size(),
      None => 0,
    }
  }

  /// The epoch the peer is currently writing from.
  pub fn get_read_epoch(&self) -> usize {
    self.read_epoch
  }

  /// User data attached to the connection.
  pub fn get_data_ptr(&mut self) -> &mut Option<Box<dyn Any + Send>> {
    &mut self.data_ptr
  }

  /// True once early data sent by the client was accepted by the server.
  pub fn early_data_accepted(&self) -> bool {
    self.early_data_accepted
  }

  // === Handshake driving ===

  /// Drives the handshake with `input` bytes from the peer, appending
  /// outbound records to `sendbuf`. Everything in `sendbuf` must be
  /// transmitted even when an error is returned.
  pub fn handshake(
    &mut self,
    sendbuf: &mut Buffer,
    input: &[u8],
    properties: &mut HandshakeProperties,
  ) -> Result<HandshakeStatus, Error> {
    if self.ctx.update_traffic_key.is_some() {
      return Err(Error::Library("use handle_message when the record layer is external"));
    }
    let mut consumed = 0;
    let result = self.handshake_records(input, &mut consumed, properties);
    match result {
      Ok(()) => {
        self.flush_stream(sendbuf)?;
        if self.handshake_complete {
          Ok(HandshakeStatus::Complete { consumed })
        } else {
          Ok(HandshakeStatus::InProgress)
        }
      },
      Err(err) => {
        let _ = self.flush_stream(sendbuf);
        self.fail(Some(sendbuf), &err);
        Err(err)
      },
    }
  }

  fn handshake_records(
    &mut self,
    input: &[u8],
    consumed: &mut usize,
    properties: &mut HandshakeProperties,
  ) -> Result<(), Error> {
    if self.state == State::Failed {
      return Err(Error::Library("connection has failed"));
    }
    if self.handshake_complete {
      return Ok(());
    }
    if self.state == State::ClientStart {
      self.client_start(properties)?;
    }
    loop {
      if self.handshake_complete {
        return Ok(());
      }
      // Drain any messages already reassembled before asking for more bytes.
      self.drain_joiner(properties)?;
      if self.handshake_complete {
        return Ok(());
      }
      let need = self.record_bytes_needed()?;
      let available = input.len() - *consumed;
      if available == 0 && need > 0 {
        return Ok(());
      }
      let take = need.min(available);
      self.recv_record_buf.extend_from_slice(&input[*consumed..*consumed + take]);
      *consumed += take;
      if take < need {
        return Ok(());
      }
      let (content_type, payload) = self.take_record()?;
      self.process_inbound_record(content_type, payload, properties)?;
    }
  }

  /// Bytes still missing before `recv_record_buf` holds one whole record.
  fn record_bytes_needed(&self) -> Result<usize, Error> {
    match parse_record_header(&self.recv_record_buf)? {
      None => Ok(RECORD_HEADER_SIZE - self.recv_record_buf.len()),
      Some(header) => {
        Ok((RECORD_HEADER_SIZE + header.len).saturating_sub(self.recv_record_buf.len()))
      },
    }
  }

  /// Splits the completed record out of `recv_record_buf`.
  fn take_record(&mut self) -> Result<(u8, Vec<u8>), Error> {
    let header = parse_record_header(&self.recv_record_buf)?
      .ok_or(Error::Library("take_record called without a complete record"))?;
    let payload = self.recv_record_buf[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + header.len].to_vec();
    let content_type = header.content_type;
    self.recv_record_buf.clear();
    Ok((content_type, payload))
  }

  fn process_inbound_record(
    &mut self,
    content_type: u8,
    payload: Vec<u8>,
    properties: &mut HandshakeProperties,
  ) -> Result<(), Error> {
    match ContentType::from_u8(content_type) {
      Some(ContentType::ChangeCipherSpec) => {
        // Dropped silently before the handshake completes.
        if self.handshake_complete || payload != [1] {
          return Err(Error::alert(AlertDescription::UnexpectedMessage));
        }
        Ok(())
      },
      Some(ContentType::Alert) if self.dec[self.read_epoch].is_none() => {
        self.handle_alert(&payload)
      },
      Some(ContentType::Handshake) if self.dec[self.read_epoch].is_none() => {
        self.joiner.push(&payload);
        self.drain_joiner(properties)
      },
      Some(ContentType::Alert) => {
        // A peer without our keys yet may still alert in plaintext.
        self.handle_alert(&payload)
      },
      Some(ContentType::ApplicationData) => {
        let (inner, plaintext) = self.open_protected(&payload)?;
        match inner {
          ContentType::Handshake => {
            self.joiner.push(&plaintext);
            self.drain_joiner(properties)
          },
          ContentType::Alert => self.handle_alert(&plaintext),
          ContentType::ApplicationData => self.accept_early_data(plaintext),
          ContentType::ChangeCipherSpec => Err(Error::alert(AlertDescription::UnexpectedMessage)),
        }
      },
      _ => Err(Error::alert(AlertDescription::UnexpectedMessage)),
    }
  }

  /// Opens a protected record under the current read epoch, handling the
  /// implicit early-to-handshake transition when EndOfEarlyData is omitted.
  fn open_protected(&mut self, payload: &[u8]) -> Result<(ContentType, Vec<u8>), Error> {
    if payload.len() > MAX_CIPHERTEXT_RECORD_SIZE {
      return Err(Error::alert(AlertDescription::DecodeError));
    }
    let header = record_header_for(payload.len());
    let epoch = self.read_epoch;
    let protection = self.dec[epoch]
      .as_mut()
      .ok_or_else(|| Error::alert(AlertDescription::UnexpectedMessage))?;
    match protection.open(&header, payload) {
      Ok(opened) => Ok(opened),
      Err(Error::Alert(AlertDescription::BadRecordMac))
        if epoch == EPOCH_EARLY && self.ctx.omit_end_of_early_data =>
      {
        // Without EndOfEarlyData the first handshake-epoch record marks the
        // transition.
        let next = self.dec[EPOCH_HANDSHAKE]
          .as_mut()
          .ok_or_else(|| Error::alert(AlertDescription::BadRecordMac))?;
        let opened = next.open(&header, payload)?;
        self.advance_read_epoch(EPOCH_HANDSHAKE)?;
        Ok(opened)
      },
      Err(err) => Err(err),
    }
  }

  fn accept_early_data(&mut self, plaintext: Vec<u8>) -> Result<(), Error> {
    if self.side != Side::Server || self.read_epoch != EPOCH_EARLY || !self.early_data_accepted {
      return Err(Error::alert(AlertDescription::UnexpectedMessage));
    }
    self.early_data_received += plaintext.len();
    if self.early_data_received > self.max_early_data_size as usize {
      return Err(Error::alert(AlertDescription::HandshakeFailure));
    }
    self.early_data_buf.extend_from_slice(&plaintext);
    Ok(())
  }

  pub(crate) fn drain_joiner(&mut self, properties: &mut HandshakeProperties) -> Result<(), Error> {
    while let Some((typ, message)) = self.joiner.next()? {
      trace!(?typ, side = ?self.side, state = ?self.state, "handshake message");
      match self.side {
        Side::Client => self.client_handle_message(typ, &message, properties)?,
        Side::Server => self.server_handle_message(typ, &message, properties)?,
      }
      if self.handshake_complete && !self.joiner.has_pending() {
        break;
      }
    }
    Ok(())
  }

  fn handle_alert(&mut self, payload: &[u8]) -> Result<(), Error> {
    if payload.len() != 2 {
      return Err(Error::alert(AlertDescription::DecodeError));
    }
    let level = payload[0];
    let desc = AlertDescription::from_u8(payload[1]);
    debug!(level, %desc, "alert received");
    if level == ALERT_LEVEL_WARNING && desc == AlertDescription::UserCanceled {
      return Ok(());
    }
    Err(Error::PeerAlert(desc))
  }

  // === Emission plumbing ===

  /// Queues a full handshake message, optionally feeding it to the
  /// transcript.
  pub(crate) fn push_handshake_emit(
    &mut self,
    epoch: usize,
    message: Vec<u8>,
    to_transcript: bool,
  ) -> Result<(), Error> {
    if to_transcript {
      self
        .key_schedule
        .as_mut()
        .ok_or(Error::Library("emitting before key schedule exists"))?
        .update_hash(&message);
    }
    self.emit_queue.push(EmitItem { epoch, content: ContentType::Handshake, bytes: message });
    Ok(())
  }

  /// Queues the middlebox-compatibility ChangeCipherSpec, once.
  pub(crate) fn push_change_cipher_spec(&mut self) {
    if self.change_cipher_spec_sent || self.ctx.update_traffic_key.is_some() {
      return;
    }
    self.change_cipher_spec_sent = true;
    self.emit_queue.push(EmitItem {
      epoch: EPOCH_INITIAL,
      content: ContentType::ChangeCipherSpec,
      bytes: Vec::new(),
    });
  }

  /// Flushes queued messages as records into `sendbuf`.
  fn flush_stream(&mut self, sendbuf: &mut Buffer) -> Result<(), Error> {
    let queue = std::mem::take(&mut self.emit_queue);
    let mut iter = queue.into_iter().peekable();
    while let Some(item) = iter.next() {
      if item.content == ContentType::ChangeCipherSpec {
        sendbuf.extend_from_slice(&CHANGE_CIPHER_SPEC_RECORD);
        continue;
      }
      // Coalesce consecutive same-epoch handshake messages into records.
      let mut bytes = item.bytes;
      while let Some(next) = iter.peek() {
        if next.epoch == item.epoch && next.content == item.content {
          bytes.extend_from_slice(&iter.next().expect("peeked").bytes);
        } else {
          break;
        }
      }
      if item.epoch == EPOCH_INITIAL {
        emit_plaintext_record(sendbuf, item.content, &bytes);
      } else {
        let protection = self.enc[item.epoch]
          .as_mut()
          .ok_or(Error::Library("no write protection for queued epoch"))?;
        protection.seal_into(sendbuf, item.content, &bytes)?;
      }
    }
    Ok(())
  }

  /// Flushes queued messages as raw bytes segregated by epoch
  /// (message-oriented mode).
  fn flush_messages(
    &mut self,
    sendbuf: &mut Buffer,
    epoch_offsets: &mut [usize; 5],
  ) -> Result<(), Error> {
    let queue = std::mem::take(&mut self.emit_queue);
    for item in queue {
      if item.content != ContentType::Handshake {
        continue;
      }
      let at = epoch_offsets[item.epoch + 1];
      sendbuf.insert_slice(at, &item.bytes);
      for offset in epoch_offsets.iter_mut().skip(item.epoch + 1) {
        *offset += item.bytes.len();
      }
    }
    Ok(())
  }

  /// Marks the connection unusable and, when possible, appends the mapped
  /// fatal alert for the peer.
  fn fail(&mut self, sendbuf: Option<&mut Buffer>, err: &Error) {
    if self.state == State::Failed {
      return;
    }
    debug!(code = err.code(), "connection failed: {err}");
    self.state = State::Failed;
    if let (Some(sendbuf), Some(desc)) = (sendbuf, err.alert_to_send()) {
      let _ = self.emit_alert_record(sendbuf, ALERT_LEVEL_FATAL, desc);
    }
  }

  fn emit_alert_record(
    &mut self,
    sendbuf: &mut Buffer,
    level: u8,
    desc: AlertDescription,
  ) -> Result<(), Error> {
    let body = [level, desc.as_u8()];
    match self.enc[self.write_epoch].as_mut() {
      Some(protection) => protection.seal_into(sendbuf, ContentType::Alert, &body),
      None => {
        emit_plaintext_record(sendbuf, ContentType::Alert, &body);
        Ok(())
      },
    }
  }

  // === Post-handshake data path ===

  /// Seals application data. Before the handshake completes this is only
  /// permitted for client early data.
  pub fn send(&mut self, sendbuf: &mut Buffer, data: &[u8]) -> Result<(), Error> {
    if self.state == State::Failed {
      return Err(Error::Library("connection has failed"));
    }
    if !self.handshake_complete {
      return self.send_early_data(sendbuf, data);
    }
    if self.pending_key_update {
      self.pending_key_update = false;
      self.emit_key_update(sendbuf, false)?;
    }
    if self.enc[EPOCH_APPLICATION].as_ref().map_or(false, |p| p.seq() >= SEQ_SOFT_LIMIT) {
      self.emit_key_update(sendbuf, false)?;
    }
    let protection = self.enc[EPOCH_APPLICATION]
      .as_mut()
      .ok_or(Error::Library("application keys not installed"))?;
    protection.seal_into(sendbuf, ContentType::ApplicationData, data)
  }

  fn send_early_data(&mut self, sendbuf: &mut Buffer, data: &[u8]) -> Result<(), Error> {
    if self.side != Side::Client || !self.early_data_offered {
      return Err(Error::Library("handshake is not complete"));
    }
    if data.len() > self.max_early_data_size as usize {
      return Err(Error::Library("early data exceeds the ticket allowance"));
    }
    let protection = self.enc[EPOCH_EARLY]
      .as_mut()
      .ok_or(Error::Library("early data keys not installed"))?;
    protection.seal_into(sendbuf, ContentType::ApplicationData, data)
  }

  /// Opens exactly one record of peer data, appending any plaintext to
  /// `plainbuf`. Post-handshake handshake messages (NewSessionTicket,
  /// KeyUpdate) are processed internally and produce no plaintext.
  pub fn receive(&mut self, plainbuf: &mut Buffer, input: &[u8]) -> Result<ReceiveStatus, Error> {
    if self.state == State::Failed {
      return Err(Error::Library("connection has failed"));
    }
    // Early data buffered during the handshake is drained first.
    if !self.early_data_buf.is_empty() {
      plainbuf.extend_from_slice(&self.early_data_buf);
      self.early_data_buf.clear();
      return Ok(ReceiveStatus::Record { consumed: 0 });
    }
    let mut consumed = 0;
    let need = match self.record_bytes_needed() {
      Ok(need) => need,
      Err(err) => {
        self.fail(None, &err);
        return Err(err);
      },
    };
    let take = need.min(input.len());
    self.recv_record_buf.extend_from_slice(&input[..take]);
    consumed += take;
    if take < need {
      return Ok(ReceiveStatus::InProgress);
    }
    match self.receive_record(plainbuf) {
      Ok(()) => Ok(ReceiveStatus::Record { consumed }),
      Err(err) => {
        self.fail(None, &err);
        Err(err)
      },
    }
  }

  fn receive_record(&mut self, plainbuf: &mut Buffer) -> Result<(), Error> {
    let (content_type, payload) = self.take_record()?;
    match ContentType::from_u8(content_type) {
      Some(ContentType::ChangeCipherSpec) if !self.handshake_complete => Ok(()),
      Some(ContentType::Alert) if self.dec[self.read_epoch].is_none() => self.handle_alert(&payload),
      Some(ContentType::ApplicationData) => {
        let (inner, plaintext) = self.open_protected(&payload)?;
        match inner {
          ContentType::ApplicationData => {
            if !self.handshake_complete {
              return self.accept_early_data(plaintext);
            }
            plainbuf.extend_from_slice(&plaintext);
            Ok(())
          },
          ContentType::Handshake => {
            if !self.handshake_complete {
              return Err(Error::Library("feed handshake records to handshake()"));
            }
            self.joiner.push(&plaintext);
            self.drain_post_handshake()
          },
          ContentType::Alert => self.handle_alert(&plaintext),
          ContentType::ChangeCipherSpec => Err(Error::alert(AlertDescription::UnexpectedMessage)),
        }
      },
      _ => Err(Error::alert(AlertDescription::UnexpectedMessage)),
    }
  }

  fn drain_post_handshake(&mut self) -> Result<(), Error> {
    while let Some((typ, message)) = self.joiner.next()? {
      match typ {
        HandshakeType::NewSessionTicket if self.side == Side::Client => {
          self.client_handle_new_session_ticket(&message[4..])?;
        },
        HandshakeType::KeyUpdate => {
          let update_requested = crate::msgs::parse_key_update(&message[4..])?;
          let prefix = self.ctx.label_prefix().to_string();
          let updated = self.dec[EPOCH_APPLICATION]
            .as_ref()
            .ok_or_else(|| Error::alert(AlertDescription::UnexpectedMessage))?
            .updated(&prefix)?;
          self.dec[EPOCH_APPLICATION] = Some(updated);
          if update_requested {
            self.pending_key_update = true;
          }
          debug!(update_requested, "key update received");
        },
        _ => return Err(Error::alert(AlertDescription::UnexpectedMessage)),
      }
    }
    Ok(())
  }

  /// Sends an alert record of the given level and description.
  pub fn send_alert(
    &mut self,
    sendbuf: &mut Buffer,
    level: u8,
    desc: AlertDescription,
  ) -> Result<(), Error> {
    if level != ALERT_LEVEL_WARNING && level != ALERT_LEVEL_FATAL {
      return Err(Error::Library("bad alert level"));
    }
    self.emit_alert_record(sendbuf, level, desc)
  }

  /// Rekeys the send direction and tells the peer, optionally requesting that
  /// it update its own keys in return.
  pub fn update_key(&mut self, sendbuf: &mut Buffer, request_update: bool) -> Result<(), Error> {
    if !self.handshake_complete {
      return Err(Error::Library("update_key before handshake completion"));
    }
    self.emit_key_update(sendbuf, request_update)
  }

  fn emit_key_update(&mut self, sendbuf: &mut Buffer, request_update: bool) -> Result<(), Error> {
    // The KeyUpdate message itself travels under the old key.
    let mut msg = Buffer::new();
    crate::msgs::push_handshake_message(&mut msg, None, HandshakeType::KeyUpdate, |buf| {
      buf.push_u8(request_update as u8);
      Ok(())
    })?;
    let prefix = self.ctx.label_prefix().to_string();
    let updated = {
      let protection = self.enc[EPOCH_APPLICATION]
        .as_mut()
        .ok_or(Error::Library("application keys not installed"))?;
      protection.seal_into(sendbuf, ContentType::Handshake, msg.as_slice())?;
      protection.updated(&prefix)?
    };
    self.enc[EPOCH_APPLICATION] = Some(updated);
    debug!(request_update, "key update sent");
    Ok(())
  }

  /// Derives an exporter secret (RFC 8446 §7.5).
  pub fn export_secret(
    &self,
    label: &str,
    context_value: &[u8],
    is_early: bool,
    outlen: usize,
  ) -> Result<Zeroizing<Vec<u8>>, Error> {
    let master = if is_early { &self.early_exporter_master } else { &self.exporter_master };
    let master = master.as_ref().ok_or(Error::NotAvailable)?;
    let suite = self.suite.ok_or(Error::NotAvailable)?;
    let prefix = self.ctx.label_prefix();
    let derived = hkdf_expand_label(
      suite.hash,
      master,
      label,
      suite.hash.empty_digest(),
      suite.hash.digest_size(),
      prefix,
    )?;
    let mut ctx_hash = suite.hash.start();
    ctx_hash.update(context_value);
    hkdf_expand_label(suite.hash, &derived, "exporter", &ctx_hash.snapshot(), outlen, prefix)
  }

  // === Message-oriented entry point (QUIC) ===

  /// Runs the handshake directly on handshake messages, with outbound
  /// messages segregated by epoch into `sendbuf` ranges delimited by
  /// `epoch_offsets`. Requires the `update_traffic_key` capability; bytes for
  /// future epochs are buffered, bytes from past epochs are refused.
  pub fn handle_message(
    &mut self,
    sendbuf: &mut Buffer,
    epoch_offsets: &mut [usize; 5],
    in_epoch: usize,
    input: &[u8],
    properties: &mut HandshakeProperties,
  ) -> Result<HandshakeStatus, Error> {
    if self.ctx.update_traffic_key.is_none() {
      return Err(Error::Library("handle_message requires update_traffic_key"));
    }
    if self.state == State::Failed {
      return Err(Error::Library("connection has failed"));
    }
    let result = self.handle_message_inner(in_epoch, input, properties);
    match result {
      Ok(()) => {
        self.flush_messages(sendbuf, epoch_offsets)?;
        if self.handshake_complete {
          Ok(HandshakeStatus::Complete { consumed: input.len() })
        } else {
          Ok(HandshakeStatus::InProgress)
        }
      },
      Err(err) => {
        let _ = self.flush_messages(sendbuf, epoch_offsets);
        self.fail(None, &err);
        Err(err)
      },
    }
  }

  fn handle_message_inner(
    &mut self,
    in_epoch: usize,
    input: &[u8],
    properties: &mut HandshakeProperties,
  ) -> Result<(), Error> {
    if self.state == State::ClientStart {
      self.client_start(properties)?;
    }
    if input.is_empty() {
      return Ok(());
    }
    if in_epoch > EPOCH_APPLICATION {
      return Err(Error::Library("epoch out of range"));
    }
    if in_epoch < self.read_epoch {
      return Err(Error::alert(AlertDescription::UnexpectedMessage));
    }
    if in_epoch > self.read_epoch {
      self.pending_by_epoch[in_epoch].extend_from_slice(input);
      return Ok(());
    }
    self.joiner.push(input);
    self.drain_joiner(properties)?;
    if self.handshake_complete {
      // Post-handshake messages may follow in the same feed.
      self.drain_post_handshake()?;
    }
    Ok(())
  }

  /// Advances the read epoch, releasing the old protection and replaying any
  /// bytes buffered for the new epoch (message mode).
  pub(crate) fn advance_read_epoch(&mut self, epoch: usize) -> Result<(), Error> {
    debug_assert!(epoch >= self.read_epoch);
    if epoch != self.read_epoch {
      self.dec[self.read_epoch] = None;
      self.read_epoch = epoch;
    }
    let buffered = std::mem::take(&mut self.pending_by_epoch[epoch]);
    if !buffered.is_empty() {
      self.joiner.push(&buffered);
    }
    Ok(())
  }

  // === Secret installation ===

  /// Installs a traffic secret for one direction and epoch, either as a live
  /// record protection or by handing it to the external record layer.
  pub(crate) fn install_protection(
    &mut self,
    is_enc: bool,
    epoch: usize,
    secret: &[u8],
  ) -> Result<(), Error> {
    let suite = self.suite.ok_or(Error::Library("installing keys before suite selection"))?;
    self.keylog(keylog_label(self.side, is_enc, epoch), secret);
    if let Some(sched) = &self.key_schedule {
      sched.trace_secret(keylog_label(self.side, is_enc, epoch), secret);
    }
    if let Some(update) = &self.ctx.update_traffic_key {
      update.update(is_enc, epoch, secret, suite)?;
      return Ok(());
    }
    let protection = TrafficProtection::new(suite, secret, epoch, self.ctx.label_prefix())?;
    if is_enc {
      self.enc[epoch] = Some(protection);
    } else {
      self.dec[epoch] = Some(protection);
    }
    Ok(())
  }

  pub(crate) fn keylog(&self, label: &str, secret: &[u8]) {
    if let Some(log) = &self.ctx.log_event {
      log.log(&self.client_random, label, secret);
    }
  }
}

/// Reconstructs the AAD header for an inbound protected record.
fn record_header_for(len: usize) -> [u8; RECORD_HEADER_SIZE] {
  [ContentType::ApplicationData as u8, 0x03, 0x03, (len >> 8) as u8, len as u8]
}

fn keylog_label(side: Side, is_enc: bool, epoch: usize) -> &'static str {
  let client_secret = (side == Side::Client) == is_enc;
  match (epoch, client_secret) {
    (EPOCH_EARLY, _) => "CLIENT_EARLY_TRAFFIC_SECRET",
    (EPOCH_HANDSHAKE, true) => "CLIENT_HANDSHAKE_TRAFFIC_SECRET",
    (EPOCH_HANDSHAKE, false) => "SERVER_HANDSHAKE_TRAFFIC_SECRET",
    (EPOCH_APPLICATION, true) => "CLIENT_TRAFFIC_SECRET_0",
    (EPOCH_APPLICATION, false) => "SERVER_TRAFFIC_SECRET_0",
    _ => "TRAFFIC_SECRET",
  }
}

impl Drop for Connection {
  fn drop(&mut self) {
    if let Some(counter) = &self.ctx.update_open_count {
      counter.update(-1);
    }
  }
}

impl std::fmt::Debug for Connection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connection")
      .field("side", &self.side)
      .field("state", &self.state)
      .field("suite", &self.suite)
      .field("handshake_complete", &self.handshake_complete)
      .finish_non_exhaustive()
  }
}

/// Decodes a cached session offered for resumption and checks that it is
/// still usable with the configured cipher suites and lifetime window.
pub(crate) fn usable_session(
  ctx: &Context,
  suites: &[&'static CipherSuite],
  encoded: &[u8],
) -> Option<(CachedSession, &'static CipherSuite)> {
  let session = CachedSession::decode(encoded).ok()?;
  let suite = crate::crypto::find_cipher_suite(suites, session.suite_id)?;
  let now = ctx.now_millis();
  let expires = session.obtained_at.saturating_add(session.lifetime as u64 * 1000);
  if session.lifetime == 0 || now >= expires {
    return None;
  }
  Some((session, suite))
}
