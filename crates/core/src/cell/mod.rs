mod codec;
mod relay;

pub use codec::{
    read_cell, read_versions, write_cell, write_versions, Cell, CellCommand, CellError,
};
pub use relay::{
    begin_body, destroy_reason, end_reason, handshake_reply_body, parse_begin,
    parse_handshake_reply, Extend2, HandshakeRequest, LinkSpecifier, RelayCell, RelayCommand,
    HTYPE_X25519,
};
