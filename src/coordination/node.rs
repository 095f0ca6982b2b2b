/// Derive a fresh owner token for one lock instance.
///
/// `<hostname>-<pid>-<uuid>`: the host and process make the holder easy to
/// identify when inspecting the store, the UUIDv4 keeps tokens unique across
/// instances in the same process.
pub fn owner_token() -> String {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    format!(
        "{hostname}-{}-{}",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    )
}
