//! Concrete model drivers.
//!
//! Every hosted backend this build talks to speaks the OpenAI-compatible
//! chat-completions wire format; provider-specific base URLs and key
//! handling live in the factory (`provider::create_provider`).

pub mod openai;
