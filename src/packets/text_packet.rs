//! Creator and Comment packets: free-form UTF-8 text.

use crate::domain::SetId;

pub const CREATOR_TYPE_TAG: &[u8; 8] = b"PAR CRE\0";
pub const COMMENT_TYPE_TAG: &[u8; 8] = b"PAR COM\0";

/// Client identification written into every generated file.
pub const CLIENT_NAME: &str = concat!("par3rs version ", env!("CARGO_PKG_VERSION"));

pub fn make_creator_packet(set_id: SetId) -> Vec<u8> {
    super::make_packet(set_id, CREATOR_TYPE_TAG, CLIENT_NAME.as_bytes())
}

pub fn make_comment_packet(set_id: SetId, comment: &str) -> Vec<u8> {
    super::make_packet(set_id, COMMENT_TYPE_TAG, comment.as_bytes())
}
