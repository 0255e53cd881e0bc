//! Engine and supervisor scenarios against the in-memory remote
