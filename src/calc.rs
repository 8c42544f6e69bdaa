use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;

pub const EXCELLENT_MIN: f64 = 87.0;
pub const GOOD_MIN: f64 = 74.0;
pub const SATISFACTORY_MIN: f64 = 61.0;

pub const ATTENDANCE_HIGH_MIN: f64 = 90.0;
pub const ATTENDANCE_MEDIUM_MIN: f64 = 75.0;

pub const RATING_MIN: i64 = 1;
pub const RATING_MAX: i64 = 5;

/// Two-decimal rounding applied to every percentage and average on output.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn mean<I>(values: I) -> Option<f64>
where
    I: IntoIterator<Item = f64>,
{
    let mut sum = 0.0;
    let mut n = 0usize;
    for v in values {
        sum += v;
        n += 1;
    }
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LetterGrade {
    Excellent,
    Good,
    Satisfactory,
    Unsatisfactory,
}

impl LetterGrade {
    pub fn label(self) -> &'static str {
        match self {
            LetterGrade::Excellent => "отлично",
            LetterGrade::Good => "хорошо",
            LetterGrade::Satisfactory => "удовлетворительно",
            LetterGrade::Unsatisfactory => "неудовлетворительно",
        }
    }

    /// Five-point scale equivalent.
    pub fn points(self) -> i64 {
        match self {
            LetterGrade::Excellent => 5,
            LetterGrade::Good => 4,
            LetterGrade::Satisfactory => 3,
            LetterGrade::Unsatisfactory => 2,
        }
    }

    pub fn from_points(points: i64) -> Option<Self> {
        match points {
            5 => Some(LetterGrade::Excellent),
            4 => Some(LetterGrade::Good),
            3 => Some(LetterGrade::Satisfactory),
            2 => Some(LetterGrade::Unsatisfactory),
            _ => None,
        }
    }
}

pub fn letter_grade(average_percentage: f64) -> LetterGrade {
    if average_percentage >= EXCELLENT_MIN {
        LetterGrade::Excellent
    } else if average_percentage >= GOOD_MIN {
        LetterGrade::Good
    } else if average_percentage >= SATISFACTORY_MIN {
        LetterGrade::Satisfactory
    } else {
        LetterGrade::Unsatisfactory
    }
}

pub fn submission_percentage(score: Option<f64>, max_score: f64) -> Option<f64> {
    let score = score?;
    if max_score <= 0.0 {
        return None;
    }
    Some(100.0 * score / max_score)
}

/// One submission (or a missing one) joined with names for display.
#[derive(Debug, Clone)]
pub struct GradeInput {
    pub student_id: String,
    pub student_name: String,
    pub subject_id: String,
    pub subject_name: String,
    pub group_id: String,
    pub group_name: String,
    pub score: Option<f64>,
    pub max_score: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSubjectGrade {
    pub student_id: String,
    pub student_name: String,
    pub subject_id: String,
    pub subject_name: String,
    pub group_id: String,
    pub group_name: String,
    pub graded_count: usize,
    pub pending_count: usize,
    pub average_percentage: Option<f64>,
    pub letter_grade: Option<LetterGrade>,
    pub grade_label: Option<&'static str>,
    pub grade_points: Option<i64>,
}

/// Groups submissions by (student, subject, group) and averages their percentages.
pub fn aggregate_grades(rows: &[GradeInput]) -> Vec<StudentSubjectGrade> {
    struct Acc<'a> {
        first: &'a GradeInput,
        percents: Vec<f64>,
        pending: usize,
    }

    let mut by_key: HashMap<(&str, &str, &str), Acc> = HashMap::new();
    for row in rows {
        let key = (
            row.student_id.as_str(),
            row.subject_id.as_str(),
            row.group_id.as_str(),
        );
        let acc = by_key.entry(key).or_insert_with(|| Acc {
            first: row,
            percents: Vec::new(),
            pending: 0,
        });
        match submission_percentage(row.score, row.max_score) {
            Some(p) => acc.percents.push(p),
            None => acc.pending += 1,
        }
    }

    let mut out: Vec<StudentSubjectGrade> = by_key
        .into_values()
        .map(|acc| {
            let avg = mean(acc.percents.iter().copied()).map(round2);
            let grade = avg.map(letter_grade);
            StudentSubjectGrade {
                student_id: acc.first.student_id.clone(),
                student_name: acc.first.student_name.clone(),
                subject_id: acc.first.subject_id.clone(),
                subject_name: acc.first.subject_name.clone(),
                group_id: acc.first.group_id.clone(),
                group_name: acc.first.group_name.clone(),
                graded_count: acc.percents.len(),
                pending_count: acc.pending,
                average_percentage: avg,
                letter_grade: grade,
                grade_label: grade.map(LetterGrade::label),
                grade_points: grade.map(LetterGrade::points),
            }
        })
        .collect();

    out.sort_by(|a, b| {
        a.student_name
            .cmp(&b.student_name)
            .then_with(|| a.subject_name.cmp(&b.subject_name))
            .then_with(|| a.group_name.cmp(&b.group_name))
            .then_with(|| a.student_id.cmp(&b.student_id))
    });
    out
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeDistribution {
    pub excellent: usize,
    pub good: usize,
    pub satisfactory: usize,
    pub unsatisfactory: usize,
    pub ungraded: usize,
    pub overall_average: Option<f64>,
}

pub fn grade_distribution(rows: &[StudentSubjectGrade]) -> GradeDistribution {
    let mut d = GradeDistribution::default();
    for r in rows {
        match r.letter_grade {
            Some(LetterGrade::Excellent) => d.excellent += 1,
            Some(LetterGrade::Good) => d.good += 1,
            Some(LetterGrade::Satisfactory) => d.satisfactory += 1,
            Some(LetterGrade::Unsatisfactory) => d.unsatisfactory += 1,
            None => d.ungraded += 1,
        }
    }
    d.overall_average = mean(rows.iter().filter_map(|r| r.average_percentage)).map(round2);
    d
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
    Excused,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Excused => "excused",
        }
    }

    pub fn counts_as_present(self) -> bool {
        matches!(self, AttendanceStatus::Present | AttendanceStatus::Late)
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "present" => Ok(AttendanceStatus::Present),
            "late" => Ok(AttendanceStatus::Late),
            "absent" => Ok(AttendanceStatus::Absent),
            "excused" => Ok(AttendanceStatus::Excused),
            other => Err(format!("unknown attendance status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AttendanceBucket {
    High,
    Medium,
    Low,
}

pub fn attendance_bucket(percentage: f64) -> AttendanceBucket {
    if percentage >= ATTENDANCE_HIGH_MIN {
        AttendanceBucket::High
    } else if percentage >= ATTENDANCE_MEDIUM_MIN {
        AttendanceBucket::Medium
    } else {
        AttendanceBucket::Low
    }
}

#[derive(Debug, Clone)]
pub struct AttendanceInput {
    pub student_id: String,
    pub subject_id: String,
    pub lesson_date: String,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAttendance {
    pub student_id: String,
    pub student_name: String,
    pub total_lessons: usize,
    pub present_count: usize,
    pub late_count: usize,
    pub absent_count: usize,
    pub excused_count: usize,
    pub percentage: Option<f64>,
    pub bucket: Option<AttendanceBucket>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceReport {
    pub lesson_count: usize,
    pub overall_percentage: Option<f64>,
    pub students: Vec<StudentAttendance>,
}

/// `roster` is (student id, display name) in display order. Records for
/// students outside the roster are ignored.
pub fn attendance_summary(
    roster: &[(String, String)],
    records: &[AttendanceInput],
) -> AttendanceReport {
    let roster_ids: HashSet<&str> = roster.iter().map(|(id, _)| id.as_str()).collect();
    let mut per_student: HashMap<&str, Vec<AttendanceStatus>> = HashMap::new();
    // A lesson is one subject on one date.
    let mut lessons: HashSet<(&str, &str)> = HashSet::new();
    for r in records {
        if !roster_ids.contains(r.student_id.as_str()) {
            continue;
        }
        lessons.insert((r.subject_id.as_str(), r.lesson_date.as_str()));
        per_student
            .entry(r.student_id.as_str())
            .or_default()
            .push(r.status);
    }

    let mut sum_present = 0usize;
    let mut sum_total = 0usize;
    let students = roster
        .iter()
        .map(|(id, name)| {
            let statuses = per_student.get(id.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            let count = |s: AttendanceStatus| statuses.iter().filter(|x| **x == s).count();
            let present_count = count(AttendanceStatus::Present);
            let late_count = count(AttendanceStatus::Late);
            let absent_count = count(AttendanceStatus::Absent);
            let excused_count = count(AttendanceStatus::Excused);
            let attended = statuses.iter().filter(|s| s.counts_as_present()).count();
            // Excused lessons neither help nor hurt the percentage.
            let total = attended + absent_count;
            sum_present += attended;
            sum_total += total;
            let percentage = if total > 0 {
                Some(round2(100.0 * attended as f64 / total as f64))
            } else {
                None
            };
            StudentAttendance {
                student_id: id.clone(),
                student_name: name.clone(),
                total_lessons: total,
                present_count,
                late_count,
                absent_count,
                excused_count,
                percentage,
                bucket: percentage.map(attendance_bucket),
            }
        })
        .collect();

    AttendanceReport {
        lesson_count: lessons.len(),
        overall_percentage: if sum_total > 0 {
            Some(round2(100.0 * sum_present as f64 / sum_total as f64))
        } else {
            None
        },
        students,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QuestionKind {
    Rating,
    Text,
}

impl QuestionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionKind::Rating => "rating",
            QuestionKind::Text => "text",
        }
    }
}

impl FromStr for QuestionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "rating" => Ok(QuestionKind::Rating),
            "text" => Ok(QuestionKind::Text),
            other => Err(format!("unknown question kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuestionDef {
    pub id: String,
    pub text: String,
    pub kind: QuestionKind,
    pub position: i64,
}

#[derive(Debug, Clone)]
pub struct SurveyAnswerInput {
    pub question_id: String,
    pub rating: Option<i64>,
    pub text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SurveyResponseInput {
    pub teacher_id: String,
    pub teacher_name: String,
    pub subject_id: String,
    pub subject_name: String,
    pub group_id: String,
    pub group_name: String,
    pub answers: Vec<SurveyAnswerInput>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionAverage {
    pub question_id: String,
    pub text: String,
    pub answer_count: usize,
    pub average_rating: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupAverage {
    pub group_id: String,
    pub group_name: String,
    pub response_count: usize,
    pub average_rating: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherSurveyResult {
    pub teacher_id: String,
    pub teacher_name: String,
    pub subject_id: String,
    pub subject_name: String,
    pub response_count: usize,
    pub average_rating: Option<f64>,
    pub questions: Vec<QuestionAverage>,
    pub groups: Vec<GroupAverage>,
    pub comments: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SurveySort {
    #[default]
    AverageRating,
    TeacherName,
}

impl FromStr for SurveySort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "averageRating" => Ok(SurveySort::AverageRating),
            "teacherName" => Ok(SurveySort::TeacherName),
            other => Err(format!("unknown sort key: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SurveyFilter {
    pub teacher_id: Option<String>,
    pub subject_id: Option<String>,
}

impl SurveyFilter {
    fn matches(&self, r: &SurveyResponseInput) -> bool {
        self.teacher_id.as_deref().map_or(true, |t| t == r.teacher_id)
            && self.subject_id.as_deref().map_or(true, |s| s == r.subject_id)
    }
}

pub fn survey_results(
    responses: &[SurveyResponseInput],
    questions: &[QuestionDef],
    filter: &SurveyFilter,
    sort: SurveySort,
) -> Vec<TeacherSurveyResult> {
    let kinds: HashMap<&str, QuestionKind> =
        questions.iter().map(|q| (q.id.as_str(), q.kind)).collect();
    let is_rating = |a: &SurveyAnswerInput| -> bool {
        kinds.get(a.question_id.as_str()) == Some(&QuestionKind::Rating) && a.rating.is_some()
    };

    // BTreeMap keeps ties in a stable order before sorting.
    let mut by_teacher: BTreeMap<(&str, &str), Vec<&SurveyResponseInput>> = BTreeMap::new();
    for r in responses.iter().filter(|r| filter.matches(r)) {
        by_teacher
            .entry((r.teacher_id.as_str(), r.subject_id.as_str()))
            .or_default()
            .push(r);
    }

    let mut ordered_questions: Vec<&QuestionDef> = questions.iter().collect();
    ordered_questions.sort_by_key(|q| q.position);

    let mut out: Vec<TeacherSurveyResult> = by_teacher
        .into_values()
        .filter_map(|group| {
            let first = *group.first()?;
            let all_ratings: Vec<f64> = group
                .iter()
                .flat_map(|r| r.answers.iter())
                .filter(|a| is_rating(*a))
                .filter_map(|a| a.rating)
                .map(|v| v as f64)
                .collect();

            let question_avgs = ordered_questions
                .iter()
                .filter(|q| q.kind == QuestionKind::Rating)
                .map(|q| {
                    let vals: Vec<f64> = group
                        .iter()
                        .flat_map(|r| r.answers.iter())
                        .filter(|a| a.question_id == q.id)
                        .filter_map(|a| a.rating)
                        .map(|v| v as f64)
                        .collect();
                    QuestionAverage {
                        question_id: q.id.clone(),
                        text: q.text.clone(),
                        answer_count: vals.len(),
                        average_rating: mean(vals.iter().copied()).map(round2),
                    }
                })
                .collect();

            let mut per_group: BTreeMap<&str, (&str, usize, Vec<f64>)> = BTreeMap::new();
            for r in &group {
                let e = per_group
                    .entry(r.group_id.as_str())
                    .or_insert_with(|| (r.group_name.as_str(), 0, Vec::new()));
                e.1 += 1;
                e.2.extend(
                    r.answers
                        .iter()
                        .filter(|a| is_rating(*a))
                        .filter_map(|a| a.rating)
                        .map(|v| v as f64),
                );
            }
            let mut groups: Vec<GroupAverage> = per_group
                .into_iter()
                .map(|(gid, (gname, n, vals))| GroupAverage {
                    group_id: gid.to_string(),
                    group_name: gname.to_string(),
                    response_count: n,
                    average_rating: mean(vals).map(round2),
                })
                .collect();
            groups.sort_by(|a, b| a.group_name.cmp(&b.group_name));

            let comments = group
                .iter()
                .flat_map(|r| r.answers.iter())
                .filter(|a| kinds.get(a.question_id.as_str()) == Some(&QuestionKind::Text))
                .filter_map(|a| a.text.as_deref())
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();

            Some(TeacherSurveyResult {
                teacher_id: first.teacher_id.clone(),
                teacher_name: first.teacher_name.clone(),
                subject_id: first.subject_id.clone(),
                subject_name: first.subject_name.clone(),
                response_count: group.len(),
                average_rating: mean(all_ratings).map(round2),
                questions: question_avgs,
                groups,
                comments,
            })
        })
        .collect();

    match sort {
        SurveySort::AverageRating => out.sort_by(|a, b| {
            // Unrated entries sink to the bottom.
            match (a.average_rating, b.average_rating) {
                (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
            .then_with(|| a.teacher_name.cmp(&b.teacher_name))
        }),
        SurveySort::TeacherName => out.sort_by(|a, b| {
            a.teacher_name
                .cmp(&b.teacher_name)
                .then_with(|| a.subject_name.cmp(&b.subject_name))
        }),
    }
    out
}
