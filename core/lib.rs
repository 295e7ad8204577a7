// Copyright 2018-2026 the Som authors. MIT license.

//! Module system, compiler driver and bundler for the Som language.
//!
//! The crate resolves import specifiers to files, loads and parses them
//! through an external [`ast::SourcePipeline`], maintains the dependency
//! graph, compiles modules in topological order and splices them into a
//! single self-contained bundle. Production concerns (timeouts, circuit
//! breakers, resource limits, metrics, structured logging, a management
//! HTTP endpoint and graceful shutdown) live in the same place the
//! features do, wired through [`ModuleSystem`].

pub mod ast;
pub mod bundler;
pub mod cache;
pub mod circuit_breaker;
pub mod compiler;
pub mod config;
pub mod errors;
pub mod fs_util;
pub mod loader;
pub mod logger;
pub mod management_server;
pub mod metrics;
pub mod module_system;
pub mod registry;
pub mod resolver;
pub mod resource_limiter;
pub mod source_map;
pub mod testing;
pub mod watcher;

pub use ast::SourcePipeline;
pub use bundler::BundleOptions;
pub use bundler::BundleOutput;
pub use bundler::Bundler;
pub use bundler::Minifier;
pub use compiler::CompileResult;
pub use compiler::CompilerDriver;
pub use config::CircularDependencyStrategy;
pub use config::ModuleSystemConfig;
pub use config::Target;
pub use errors::AnyError;
pub use errors::BundleError;
pub use errors::CircularDependencyError;
pub use errors::CompilationError;
pub use errors::ConfigurationError;
pub use errors::ResolveError;
pub use errors::TimeoutError;
pub use loader::LoadedModule;
pub use loader::ModuleLoader;
pub use module_system::ModuleSystem;
pub use module_system::ValidationReport;
pub use registry::ModuleRegistry;
pub use resolver::ResolvedModule;
pub use resolver::Resolver;
