#[cfg(feature = "actix")]
#[doc(hidden)]
pub use actix_web as __actix_web;

/// Declare the routes of a module.
///
/// Generates `pub fn routes(cfg: &mut ServiceConfig)` registering every
/// `route` (an actix service such as a `#[get]` handler) and calling the
/// `routes` function of every `load`ed submodule, which is declared too.
///
/// ```ignore
/// macros_utils::routes! {
///     load health,
///     route index,
/// }
/// ```
#[cfg(feature = "actix")]
#[macro_export]
macro_rules! routes {
    ($($kind:ident $name:ident),* $(,)?) => {
        $($crate::__declare!($kind $name);)*

        pub fn routes(cfg: &mut $crate::__actix_web::web::ServiceConfig) {
            $($crate::__register!(cfg, $kind $name);)*
        }
    };
}

#[cfg(feature = "actix")]
#[doc(hidden)]
#[macro_export]
macro_rules! __declare {
    (load $module:ident) => {
        mod $module;
    };
    (route $handler:ident) => {};
}

#[cfg(feature = "actix")]
#[doc(hidden)]
#[macro_export]
macro_rules! __register {
    ($cfg:ident, load $module:ident) => {
        $module::routes($cfg);
    };
    ($cfg:ident, route $handler:ident) => {
        $cfg.service($handler);
    };
}
