use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};

const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorLabel {
    pub label: String,
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

/// Class names and box colours, indexed by class id.
#[derive(Debug, Clone)]
pub struct LabelSet {
    labels: Vec<ColorLabel>,
}

impl LabelSet {
    pub fn new(labels: Vec<ColorLabel>) -> Self {
        Self { labels }
    }

    /// Load `label,r,g,b` lines. Blank lines are skipped.
    pub fn load(filepath: &Path) -> io::Result<Self> {
        let file = File::open(filepath)?;
        let reader = io::BufReader::new(file);
        let mut labels = Vec::new();

        for line_result in reader.lines() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            labels.push(parse_line(&line)?);
        }

        Ok(Self { labels })
    }

    /// COCO class names with a generated palette.
    pub fn coco() -> Self {
        let labels = COCO_CLASSES
            .iter()
            .enumerate()
            .map(|(index, name)| {
                let [red, green, blue] = palette(index as u32);
                ColorLabel {
                    label: name.to_string(),
                    red,
                    green,
                    blue,
                }
            })
            .collect();
        Self { labels }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn name(&self, class_id: u32) -> String {
        match self.labels.get(class_id as usize) {
            Some(color_label) => color_label.label.clone(),
            None => format!("class {class_id}"),
        }
    }

    pub fn color(&self, class_id: u32) -> [u8; 3] {
        match self.labels.get(class_id as usize) {
            Some(c) => [c.red, c.green, c.blue],
            None => palette(class_id),
        }
    }
}

fn parse_line(line: &str) -> io::Result<ColorLabel> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() != 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Invalid line format: {}", line),
        ));
    }

    let channel = |value: &str, name: &str| {
        value.trim().parse::<u8>().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid {} value in line: {}", name, line),
            )
        })
    };

    Ok(ColorLabel {
        label: parts[0].trim().to_string(),
        red: channel(parts[1], "red")?,
        green: channel(parts[2], "green")?,
        blue: channel(parts[3], "blue")?,
    })
}

/// Well-spread, stable colour for a class id (golden-angle hue walk).
fn palette(class_id: u32) -> [u8; 3] {
    let hue = (class_id as f32 * 137.508) % 360.;
    let (s, v) = (0.75f32, 0.95f32);
    let c = v * s;
    let x = c * (1. - ((hue / 60.) % 2. - 1.).abs());
    let m = v - c;
    let (r, g, b) = match (hue / 60.) as u32 {
        0 => (c, x, 0.),
        1 => (x, c, 0.),
        2 => (0., c, x),
        3 => (0., x, c),
        4 => (x, 0., c),
        _ => (c, 0., x),
    };
    [
        ((r + m) * 255.).round() as u8,
        ((g + m) * 255.).round() as u8,
        ((b + m) * 255.).round() as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_label_file() {
        let path = std::env::temp_dir().join(format!("labels-{}.txt", std::process::id()));
        let mut file = File::create(&path).unwrap();
        writeln!(file, "person, 255, 0, 0").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "dog,0,128,255").unwrap();
        drop(file);

        let labels = LabelSet::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(labels.len(), 2);
        assert_eq!(labels.name(0), "person");
        assert_eq!(labels.color(1), [0, 128, 255]);
    }

    #[test]
    fn test_parse_line_rejects_bad_channel() {
        assert!(parse_line("cat,300,0,0").is_err());
        assert!(parse_line("cat,1,2").is_err());
    }

    #[test]
    fn test_unknown_class_falls_back() {
        let labels = LabelSet::coco();

        assert_eq!(labels.len(), 80);
        assert_eq!(labels.name(0), "person");
        assert_eq!(labels.name(80), "class 80");
        assert_eq!(labels.color(80), palette(80));
    }

    #[test]
    fn test_palette_is_distinct_for_neighbours() {
        assert_ne!(palette(0), palette(1));
        assert_ne!(palette(1), palette(2));
    }
}
