mod cache;
mod fetch;
mod http;
mod loader;
mod registry;
