use time::OffsetDateTime;

fn main() {
    // dev builds carry a datestamp so log lines identify the snapshot
    let mut version = String::from(env!("CARGO_PKG_VERSION"));

    if version.ends_with("-dev") {
        let today = OffsetDateTime::now_utc().date();

        version = format!(
            "{}-{:04}{:02}{:02}",
            version,
            today.year(),
            u8::from(today.month()),
            today.day()
        );
    }

    println!("cargo:rustc-env=APP_VERSION={}", version);
    println!("cargo:rerun-if-changed=build.rs");
}
