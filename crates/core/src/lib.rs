pub mod catalog;
pub mod edit_buffer;
pub mod executor;
pub mod mutation_guard;
pub mod profiles;
pub mod row_identity;
pub mod session;
pub mod sql;
pub mod table_view;
pub mod value_codec;
pub mod workspace;
