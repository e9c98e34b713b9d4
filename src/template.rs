use crate::story::StoryPage;

/// Assembles the browsable story page: one image row and one paragraph row
/// per page. `images` pairs up with `pages` by index.
pub fn render(pages: &[StoryPage], images: &[String]) -> String {
    let rows: String = pages
        .iter()
        .zip(images)
        .map(|(page, image)| {
            format!(
                "<tr><td><img src=\"./{}\" /></td></tr><tr><td><h1>{}</h1></td></tr>",
                image, page.paragraph
            )
        })
        .collect();

    format!(
        "<html>\n  <head>\n    <title>Stories</title>\n  </head>\n  <body>\n    <table>{}</table>\n  </body>\n</html>\n",
        rows
    )
}

/// Default image names right after a generation run: candidate 0 of each page.
pub fn first_candidates(page_count: usize) -> Vec<String> {
    (0..page_count).map(|i| format!("{}-0.png", i)).collect()
}
