//! # `clem-disk`
//!
//! The disk subsystem core of an Apple IIgs emulator: GCR nibblization, the DSK/
//! 2MG/WOZ container formats, and the host-side storage unit that owns mounted
//! floppy and SmartPort images.
//!
//! ## Layers
//!
//! * [`disk::gcr`] — the 6-and-2 GCR codec and bit-level builder/reader primitives.
//! * [`disk::nibble`] — the in-memory nibblized track representation shared by
//!   every container format.
//! * [`disk::img2mg`] — the 2MG container: header parse/generate and 5.25"/3.5"
//!   nibblization and decode.
//! * [`disk::woz`] — the WOZ1/WOZ2 chunked container.
//! * [`disk::asset`] — a mountable disk image bound to its container format, plus
//!   its snapshot shape.
//! * [`disk::storage`] — the floppy drive and SmartPort unit lifecycle
//!   (mount/eject/save) and full-unit snapshotting.

pub mod disk;
