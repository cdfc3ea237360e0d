//! Protocol constants for Qualcomm Emergency Download (EDL) mode.

// ============================================================================
// Device Identification
// ============================================================================

/// Qualcomm Vendor ID
pub const QUALCOMM_VENDOR_ID: u16 = 0x05C6;

/// QDLoader 9008 (EDL / Sahara) Product ID
pub const EDL_PRODUCT_ID: u16 = 0x9008;

/// All supported PIDs for device discovery
pub const SUPPORTED_PIDS: &[u16] = &[EDL_PRODUCT_ID];

// ============================================================================
// Sahara
// ============================================================================

/// Device -> Host: hello.
pub const SAHARA_HELLO: u32 = 0x01;
/// Host -> Device: hello response.
pub const SAHARA_HELLO_RESP: u32 = 0x02;
/// Device -> Host: read a slice of the requested image (32-bit fields).
pub const SAHARA_READ_DATA: u32 = 0x03;
/// Device -> Host: image transfer finished, with status.
pub const SAHARA_END_OF_IMAGE: u32 = 0x04;
/// Host -> Device: done.
pub const SAHARA_DONE: u32 = 0x05;
/// Device -> Host: done acknowledged.
pub const SAHARA_DONE_RESP: u32 = 0x06;
/// Device -> Host: read a slice of the requested image (64-bit fields).
pub const SAHARA_READ_DATA_64: u32 = 0x12;

pub const SAHARA_HELLO_LEN: usize = 0x30;
pub const SAHARA_READ_DATA_LEN: usize = 0x14;
pub const SAHARA_END_OF_IMAGE_LEN: usize = 0x10;
pub const SAHARA_DONE_LEN: usize = 0x08;
pub const SAHARA_DONE_RESP_LEN: usize = 0x0C;
pub const SAHARA_READ_DATA_64_LEN: usize = 0x20;

/// Protocol version advertised in the hello response.
pub const SAHARA_VERSION: u32 = 2;
pub const SAHARA_VERSION_COMPATIBLE: u32 = 1;

/// Mode: device waits for an image upload.
pub const SAHARA_MODE_IMAGE_TX_PENDING: u32 = 0;

/// Image id under which the device requests the Firehose programmer.
pub const SAHARA_PROGRAMMER_IMAGE_ID: u64 = 13;

/// Largest Sahara packet we ever expect from the device.
pub const SAHARA_MAX_PACKET: usize = 0x400;

// ============================================================================
// Firehose
// ============================================================================

/// Payload size proposed in `<configure>` and default transfer chunk.
pub const FIREHOSE_DEFAULT_PAYLOAD: usize = 1024 * 1024;

/// Read size for Firehose response documents.
pub const FIREHOSE_READ_SIZE: usize = 4096;

/// Upper bound on buffered, unterminated response bytes.
pub const FIREHOSE_MAX_PENDING: usize = 64 * 1024;
