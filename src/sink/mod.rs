//! Measurement record sink.
//!
//! Completed datapoints leave the engine as flat records whose field order
//! is fixed by a [`Schema`] built at device registration: the common fields,
//! one residency delta per valid C-state, then the device-specific trace
//! fields.


use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

use arrayvec::ArrayVec;

use crate::error::{Error, Result};

/// Upper bound on the number of fields in a record.
pub const MAX_RECORD_FIELDS: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FieldType {
    U32,
    U64,
}

/// A single record field descriptor.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FieldDesc {
    pub name: String,
    pub ty: FieldType,
}

/// The emitted-record layout. Field order is stable for the lifetime of a
/// device registration.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Schema {
    pub fields: Vec<FieldDesc>,
}

/// One measurement record: field values in [`Schema`] order.
///
/// Every value is 64-bit; fields declared [`FieldType::U32`] carry their
/// value widened. The storage is fixed-capacity so composing a record never
/// allocates.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Record {
    pub values: ArrayVec<u64, MAX_RECORD_FIELDS>,
}

/// Where completed measurement records go.
///
/// All calls are serialized by the engine's enable mutex: `submit` never
/// races `activate`/`deactivate`, and the sink is never torn down under a
/// submitting armer.
pub trait RecordSink: Send {
    /// The engine is enabled; records laid out per `schema` will follow.
    fn activate(&mut self, schema: &Schema) -> Result<()>;

    /// The engine is disabled; no more records until the next `activate`.
    fn deactivate(&mut self);

    /// Accept one record. [`Error::SinkBackpressure`] tells the engine to
    /// drop the record and continue.
    fn submit(&mut self, record: &Record) -> Result<()>;
}

/// A bounded in-process sink handing records to a consumer thread.
pub struct RingSink {
    tx: SyncSender<Record>,
    active: bool,
}

impl RingSink {
    /// Create a sink with room for `capacity` in-flight records, and the
    /// receiving end for the consumer.
    pub fn with_capacity(capacity: usize) -> (Self, Receiver<Record>) {
        let (tx, rx) = sync_channel(capacity);
        (Self { tx, active: false }, rx)
    }
}

impl RecordSink for RingSink {
    fn activate(&mut self, _schema: &Schema) -> Result<()> {
        self.active = true;
        Ok(())
    }

    fn deactivate(&mut self) {
        self.active = false;
    }

    fn submit(&mut self, record: &Record) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        match self.tx.try_send(record.clone()) {
            Ok(()) => Ok(()),
            // A full ring and a gone consumer both mean the record has
            // nowhere to go; neither should stop the measurements.
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                Err(Error::SinkBackpressure)
            }
        }
    }
}
