//! Sockets: live browser connections, indexed two ways.

pub mod handlers;
pub mod manager;

use std::rc::Rc;

use crate::socket::BrowserSocket;

pub use manager::SocketTable;

pub struct Socket {
    pub scope: String,
    pub connection: Rc<dyn BrowserSocket>,
}

pub type SocketRef = Rc<std::cell::RefCell<Socket>>;
