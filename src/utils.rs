use indicatif::ProgressStyle;

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
        .expect("failed to build progress style")
        .progress_chars("##-")
}

pub fn pb_style_speed() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {pos:>7} {per_sec} {msg}")
        .expect("failed to build progress style")
}
