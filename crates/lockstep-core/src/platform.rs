pub const GENERIC_PLATFORM: &str = "any";

pub fn current_platform() -> String {
    format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS)
}

pub fn platform_compatible(candidate: &str, target: &str) -> bool {
    candidate == GENERIC_PLATFORM || candidate == target
}
