//! Print the image stimuli a session would pick up, in trial order.
//!
//! Usage:
//!   list_images [dir]            (default: $IMAGE_DIR or ./images)

use coin_task::stimuli::list_images;
use std::env;
use std::path::PathBuf;

fn main() {
    let dir = env::args()
        .nth(1)
        .or_else(|| env::var("IMAGE_DIR").ok())
        .unwrap_or_else(|| "images".to_string());

    let images = match list_images(PathBuf::from(&dir).as_path()) {
        Ok(images) => images,
        Err(err) => {
            eprintln!("cannot list {}: {:#}", dir, err);
            std::process::exit(1);
        }
    };

    println!("Found {} image file(s) in {}:", images.len(), dir);
    for (i, name) in images.iter().enumerate() {
        println!("{:>4}  {}", i + 1, name);
    }
}
