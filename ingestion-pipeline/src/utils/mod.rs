pub mod archive;
pub mod chunking;
pub mod llm_instructions;
pub mod text_extraction;
