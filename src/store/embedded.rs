//! Embedded SQL migrations, run via `refinery` at process startup.
//!
//! SQL files live in `src/store/migrations/`; `refinery::embed_migrations!` scans that directory
//! at compile time and generates a nested `migrations` module with a `runner()` function.

refinery::embed_migrations!("src/store/migrations");
