pub mod chunking;
pub mod config;
pub mod database;
pub mod document;
pub mod embeddings;
pub mod error;
pub mod gemini;
pub mod generation;
pub mod groq;
pub mod ingestion;
pub mod observability;
pub mod rag;
pub mod retriever;
