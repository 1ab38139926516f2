//! Binary encoding of protocol messages and frames.
//!
//! A message on the wire is `[type-code:i32][payload]`, and a frame prefixes
//! it with a `[tag:i32]`. All integers are big-endian and fixed width.
//!
//! ## Responsibilities
//! - Map every [`MessageKind`] to its stable type code through an immutable
//!   [`Registry`] built once at startup.
//! - Encode and decode the primitives (strings, booleans, optionals,
//!   collections, locations) and every message payload.
//! - Frame messages for `tokio_util::codec` via [`FrameCodec`], reporting a
//!   partially received frame as "need more bytes" rather than an error.
//! - Bound every frame by a maximum length. A collection whose count alone
//!   implies a longer frame is rejected before its elements arrive.

use crate::{
    Error, Location, Message, MessageKind, Notification, ReservedVehicle, Result, Reward, User,
};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

/// Type codes of the deployed protocol.
const STANDARD_CODES: [(i32, MessageKind); 16] = [
    (3_754_202, MessageKind::Login),
    (1_670_684_193, MessageKind::LoginResult),
    (1_670_698_141, MessageKind::Register),
    (1_670_698_175, MessageKind::RegisterResult),
    (1_670_707_048, MessageKind::FreeVehiclesNear),
    (16_707, MessageKind::FreeVehiclesResult),
    (9_673_467, MessageKind::ReserveClosest),
    (9_635_347, MessageKind::ReserveResult),
    (943_245, MessageKind::EndReservation),
    (97_343_245, MessageKind::EndReservationResult),
    (1_673_298_240, MessageKind::RewardsNear),
    (1_673_298_394, MessageKind::RewardsNearResult),
    (1_672_345, MessageKind::SubscribeToRewards),
    (1_672_346, MessageKind::UnsubscribeFromRewards),
    (3_141_592, MessageKind::RewardNotification),
    (234_663, MessageKind::NotAuthenticated),
];

/// Caps the up-front allocation for a decoded collection. The count prefix
/// comes from the peer, so the vector grows past this only as elements
/// actually decode.
const PREALLOCATION_LIMIT: usize = 1024;

/// Default upper bound on one encoded frame, tag and type code included.
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// `tag` plus `type-code`.
const FRAME_HEADER_LEN: usize = 8;

/// Encoded size of one `(Location, count)` entry of a vehicle listing.
const VEHICLE_ENTRY_LEN: usize = 12;

/// Encoded size of one [`Reward`].
const REWARD_LEN: usize = 20;

/// Bidirectional table between message kinds and their wire type codes.
#[derive(Clone, Debug)]
pub struct Registry {
    by_code: HashMap<i32, MessageKind>,
    by_kind: HashMap<MessageKind, i32>,
}

/// Accumulates registrations, rejecting any repeated code or kind.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    by_code: HashMap<i32, MessageKind>,
    by_kind: HashMap<MessageKind, i32>,
}

impl RegistryBuilder {
    pub fn register(mut self, code: i32, kind: MessageKind) -> Result<Self> {
        if let Some(existing) = self.by_code.get(&code) {
            return Err(Error::DuplicateRegistration {
                context: format!("code {code} already maps to {existing:?}"),
            });
        }
        if let Some(existing) = self.by_kind.get(&kind) {
            return Err(Error::DuplicateRegistration {
                context: format!("{kind:?} already registered with code {existing}"),
            });
        }
        self.by_code.insert(code, kind);
        self.by_kind.insert(kind, code);
        Ok(self)
    }

    pub fn build(self) -> Registry {
        Registry {
            by_code: self.by_code,
            by_kind: self.by_kind,
        }
    }
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// The registry of the deployed protocol, covering every [`MessageKind`].
    pub fn standard() -> Result<Self> {
        STANDARD_CODES
            .iter()
            .try_fold(Self::builder(), |builder, &(code, kind)| {
                builder.register(code, kind)
            })
            .map(RegistryBuilder::build)
    }

    pub fn code_of(&self, kind: MessageKind) -> Option<i32> {
        self.by_kind.get(&kind).copied()
    }

    pub fn kind_of(&self, code: i32) -> Option<MessageKind> {
        self.by_code.get(&code).copied()
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

fn put_string(dst: &mut BytesMut, value: &str) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| Error::StringTooLong { len: value.len() })?;
    dst.put_u16(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn put_bool(dst: &mut BytesMut, value: bool) {
    dst.put_u8(u8::from(value));
}

fn put_location(dst: &mut BytesMut, location: Location) {
    dst.put_i32(location.x);
    dst.put_i32(location.y);
}

fn put_count(dst: &mut BytesMut, len: usize) -> Result<()> {
    let count = i32::try_from(len).map_err(|_| Error::Malformed {
        reason: format!("collection of {len} elements does not fit a 32-bit count"),
    })?;
    dst.put_i32(count);
    Ok(())
}

fn put_optional<T>(
    dst: &mut BytesMut,
    value: Option<&T>,
    write: impl FnOnce(&mut BytesMut, &T) -> Result<()>,
) -> Result<()> {
    put_bool(dst, value.is_some());
    match value {
        Some(value) => write(dst, value),
        None => Ok(()),
    }
}

fn put_reward(dst: &mut BytesMut, reward: &Reward) {
    put_location(dst, reward.start);
    put_location(dst, reward.end);
    dst.put_i32(reward.prize);
}

fn put_rewards(dst: &mut BytesMut, rewards: &[Reward]) -> Result<()> {
    put_count(dst, rewards.len())?;
    rewards.iter().for_each(|reward| put_reward(dst, reward));
    Ok(())
}

/// Appends `[type-code][payload]` for `message` to `dst`.
///
/// On error `dst` may hold a partial encoding; [`FrameCodec`] rolls it back.
pub fn encode_message(registry: &Registry, message: &Message, dst: &mut BytesMut) -> Result<()> {
    let kind = message.kind();
    let code = registry.code_of(kind).ok_or(Error::Unregistered { kind })?;
    dst.put_i32(code);

    match message {
        Message::Login { username, password } | Message::Register { username, password } => {
            put_string(dst, username)?;
            put_string(dst, password)
        }
        Message::LoginResult { user } | Message::RegisterResult { user } => {
            put_optional(dst, user.as_ref(), |dst, user| put_string(dst, &user.username))
        }
        Message::FreeVehiclesNear { location }
        | Message::ReserveClosest { location }
        | Message::RewardsNear { location } => {
            put_location(dst, *location);
            Ok(())
        }
        Message::FreeVehiclesResult { vehicles } => {
            put_count(dst, vehicles.len())?;
            for (location, count) in vehicles {
                put_location(dst, *location);
                dst.put_i32(*count);
            }
            Ok(())
        }
        Message::ReserveResult { reservation } => {
            put_optional(dst, reservation.as_ref(), |dst, reserved| {
                put_location(dst, reserved.location);
                dst.put_i32(reserved.id);
                Ok(())
            })
        }
        Message::EndReservation {
            location,
            reservation_id,
        } => {
            put_location(dst, *location);
            dst.put_i32(*reservation_id);
            Ok(())
        }
        Message::EndReservationResult { cost, prize } => {
            put_optional(dst, cost.as_ref(), |dst, cost| {
                dst.put_i32(*cost);
                Ok(())
            })?;
            put_optional(dst, prize.as_ref(), |dst, prize| {
                dst.put_i32(*prize);
                Ok(())
            })
        }
        Message::RewardsNearResult { rewards } => put_rewards(dst, rewards),
        Message::RewardNotification { notification } => put_rewards(dst, &notification.rewards),
        Message::SubscribeToRewards
        | Message::UnsubscribeFromRewards
        | Message::NotAuthenticated => Ok(()),
    }
}

/// Why a read stopped short.
#[derive(Debug)]
enum ReadError {
    /// The buffer ends at least `missing` bytes before the value does.
    NeedMore { missing: usize },
    Invalid(Error),
}

impl From<Error> for ReadError {
    fn from(err: Error) -> Self {
        Self::Invalid(err)
    }
}

type ReadResult<T> = core::result::Result<T, ReadError>;

fn malformed(reason: impl Into<String>) -> ReadError {
    ReadError::Invalid(Error::Malformed {
        reason: reason.into(),
    })
}

/// Cursor over a byte slice that never panics on short input.
struct WireReader<'a> {
    buf: &'a [u8],
    max_frame_len: usize,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8], max_frame_len: usize) -> Self {
        Self { buf, max_frame_len }
    }

    fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, len: usize) -> ReadResult<()> {
        if self.buf.remaining() < len {
            Err(ReadError::NeedMore {
                missing: len - self.buf.remaining(),
            })
        } else {
            Ok(())
        }
    }

    fn i32(&mut self) -> ReadResult<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    fn bool(&mut self) -> ReadResult<bool> {
        self.need(1)?;
        Ok(self.buf.get_u8() != 0)
    }

    fn string(&mut self) -> ReadResult<String> {
        self.need(2)?;
        let len = usize::from(self.buf.get_u16());
        self.need(len)?;
        let (bytes, rest) = self.buf.split_at(len);
        self.buf = rest;
        String::from_utf8(bytes.to_vec()).map_err(|e| malformed(format!("invalid UTF-8: {e}")))
    }

    fn location(&mut self) -> ReadResult<Location> {
        let x = self.i32()?;
        let y = self.i32()?;
        Ok(Location::new(x, y))
    }

    /// Reads a collection count and waits until every element, each
    /// `element_len` bytes on the wire, is buffered.
    fn count(&mut self, element_len: usize) -> ReadResult<usize> {
        let count = self.i32()?;
        let count = usize::try_from(count)
            .map_err(|_| malformed(format!("negative collection count {count}")))?;
        let len = count
            .checked_mul(element_len)
            .filter(|&len| len <= self.max_frame_len)
            .ok_or_else(|| {
                malformed(format!(
                    "collection of {count} elements exceeds the {} byte frame limit",
                    self.max_frame_len
                ))
            })?;
        self.need(len)?;
        Ok(count)
    }

    fn optional<T>(
        &mut self,
        read: impl FnOnce(&mut Self) -> ReadResult<T>,
    ) -> ReadResult<Option<T>> {
        if self.bool()? {
            read(self).map(Some)
        } else {
            Ok(None)
        }
    }

    fn reward(&mut self) -> ReadResult<Reward> {
        Ok(Reward {
            start: self.location()?,
            end: self.location()?,
            prize: self.i32()?,
        })
    }

    fn rewards(&mut self) -> ReadResult<Vec<Reward>> {
        let count = self.count(REWARD_LEN)?;
        let mut rewards = Vec::with_capacity(count.min(PREALLOCATION_LIMIT));
        for _ in 0..count {
            rewards.push(self.reward()?);
        }
        Ok(rewards)
    }

    fn credentials(&mut self) -> ReadResult<(String, String)> {
        let username = self.string()?;
        let password = self.string()?;
        Ok((username, password))
    }

    fn user(&mut self) -> ReadResult<Option<User>> {
        self.optional(|r| r.string().map(|username| User { username }))
    }

    fn message(&mut self, registry: &Registry) -> ReadResult<Message> {
        let code = self.i32()?;
        let kind = registry
            .kind_of(code)
            .ok_or(ReadError::Invalid(Error::UnknownType { code }))?;

        let message = match kind {
            MessageKind::Login => {
                let (username, password) = self.credentials()?;
                Message::Login { username, password }
            }
            MessageKind::Register => {
                let (username, password) = self.credentials()?;
                Message::Register { username, password }
            }
            MessageKind::LoginResult => Message::LoginResult { user: self.user()? },
            MessageKind::RegisterResult => Message::RegisterResult { user: self.user()? },
            MessageKind::FreeVehiclesNear => Message::FreeVehiclesNear {
                location: self.location()?,
            },
            MessageKind::FreeVehiclesResult => {
                let count = self.count(VEHICLE_ENTRY_LEN)?;
                let mut vehicles = BTreeMap::new();
                for _ in 0..count {
                    let location = self.location()?;
                    let vehicles_here = self.i32()?;
                    vehicles.insert(location, vehicles_here);
                }
                Message::FreeVehiclesResult { vehicles }
            }
            MessageKind::ReserveClosest => Message::ReserveClosest {
                location: self.location()?,
            },
            MessageKind::ReserveResult => Message::ReserveResult {
                reservation: self.optional(|r| {
                    Ok(ReservedVehicle {
                        location: r.location()?,
                        id: r.i32()?,
                    })
                })?,
            },
            MessageKind::EndReservation => Message::EndReservation {
                location: self.location()?,
                reservation_id: self.i32()?,
            },
            MessageKind::EndReservationResult => Message::EndReservationResult {
                cost: self.optional(Self::i32)?,
                prize: self.optional(Self::i32)?,
            },
            MessageKind::RewardsNear => Message::RewardsNear {
                location: self.location()?,
            },
            MessageKind::RewardsNearResult => Message::RewardsNearResult {
                rewards: self.rewards()?,
            },
            MessageKind::RewardNotification => Message::RewardNotification {
                notification: Notification::new(self.rewards()?),
            },
            MessageKind::SubscribeToRewards => Message::SubscribeToRewards,
            MessageKind::UnsubscribeFromRewards => Message::UnsubscribeFromRewards,
            MessageKind::NotAuthenticated => Message::NotAuthenticated,
        };
        Ok(message)
    }
}

/// Decodes exactly one `[type-code][payload]` from the front of `src`,
/// advancing it past the consumed bytes.
///
/// A buffer that ends before the message does is `Malformed`; use
/// [`FrameCodec`] for streams where more bytes may still arrive.
pub fn decode_message(registry: &Registry, src: &mut &[u8]) -> Result<Message> {
    let mut reader = WireReader::new(src, DEFAULT_MAX_FRAME_LEN);
    match reader.message(registry) {
        Ok(message) => {
            *src = reader.buf;
            Ok(message)
        }
        Err(ReadError::NeedMore { .. }) => Err(Error::Malformed {
            reason: "message truncated".to_string(),
        }),
        Err(ReadError::Invalid(e)) => Err(e),
    }
}

/// One `(tag, message)` unit on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub tag: i32,
    pub message: Message,
}

impl Frame {
    pub fn new(tag: i32, message: Message) -> Self {
        Self { tag, message }
    }
}

/// `tokio_util` codec for `[tag:i32][type-code:i32][payload]` frames.
///
/// Frames longer than the configured maximum are refused in both directions
/// with [`Error::FrameTooLarge`].
#[derive(Clone, Debug)]
pub struct FrameCodec {
    registry: Arc<Registry>,
    max_frame_len: usize,
    /// Buffered length below which the frame in progress cannot complete.
    awaiting: usize,
}

impl FrameCodec {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_max_frame_len(registry, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(registry: Arc<Registry>, max_frame_len: usize) -> Self {
        Self {
            registry,
            max_frame_len: max_frame_len.max(FRAME_HEADER_LEN),
            awaiting: 0,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    fn too_large(&self, len: usize) -> Error {
        Error::FrameTooLarge {
            len,
            limit: self.max_frame_len,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < self.awaiting {
            return Ok(None);
        }
        let mut reader = WireReader::new(&src[..], self.max_frame_len);
        let decoded = reader
            .i32()
            .and_then(|tag| Ok(Frame::new(tag, reader.message(&self.registry)?)));
        match decoded {
            Ok(frame) => {
                let consumed = src.len() - reader.remaining();
                if consumed > self.max_frame_len {
                    return Err(self.too_large(consumed));
                }
                src.advance(consumed);
                self.awaiting = 0;
                Ok(Some(frame))
            }
            Err(ReadError::NeedMore { missing }) => {
                let awaiting = src.len().saturating_add(missing);
                if awaiting > self.max_frame_len {
                    return Err(self.too_large(awaiting));
                }
                src.reserve(missing);
                self.awaiting = awaiting;
                Ok(None)
            }
            Err(ReadError::Invalid(e)) => Err(e),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(Error::PeerClosed),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let start = dst.len();
        dst.put_i32(frame.tag);
        let encoded = encode_message(&self.registry, &frame.message, dst).and_then(|()| {
            let len = dst.len() - start;
            if len > self.max_frame_len {
                Err(self.too_large(len))
            } else {
                Ok(())
            }
        });
        encoded.inspect_err(|_| dst.truncate(start))
    }
}
