use proptest::prelude::*;
use trunk::dsn::ConnectionDescriptor;

/// Strategy for generating DNS-style host names
pub fn host_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,15}(\\.[a-z][a-z0-9]{0,10}){0,2}"
}

/// Strategy for generating database names, including characters that need escaping
pub fn database_strategy() -> impl Strategy<Value = String> {
    prop_oneof![Just(String::new()), "[a-z][a-zA-Z0-9_ %/?#.-]{0,30}"]
}

/// Strategy for generating user names, including characters that need escaping
pub fn username_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_@:/% .-]{1,16}"
}

/// Strategy for generating passwords, including characters that need escaping
pub fn password_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9!@#$%^&*():/?=+ -]{1,24}"
}

/// Strategy for generating descriptors whose credentials survive a round trip
pub fn descriptor_strategy() -> impl Strategy<Value = ConnectionDescriptor> {
    (
        host_strategy(),
        prop::option::of(1u16..=65535),
        database_strategy(),
        prop::option::of((username_strategy(), prop::option::of(password_strategy()))),
    )
        .prop_map(|(host, port, path, credentials)| {
            let (username, password) = match credentials {
                Some((user, password)) => (Some(user), password),
                None => (None, None),
            };
            ConnectionDescriptor::new(host)
                .with_port(port)
                .with_path(path)
                .with_credentials(username, password)
        })
}
