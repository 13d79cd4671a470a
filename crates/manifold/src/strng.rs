//! Cheaply clonable, reference counted strings. Used for names that are
//! copied around a lot (upstream names, tool names, session ids).

pub use arcstr::ArcStr as Strng;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	Strng::from(s.as_ref())
}

pub use arcstr::{format, literal};
